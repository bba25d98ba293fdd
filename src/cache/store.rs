use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::RunnerResult;

/// Device key/value blob store.
///
/// Calls are synchronous from the caller's point of view. A successful `put` must be durable
/// before it returns. I/O problems are reported as `StorageFailure`.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> RunnerResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, blob: &[u8]) -> RunnerResult<()>;
    fn delete(&self, key: &str) -> RunnerResult<()>;
    fn keys_with_prefix(&self, prefix: &str) -> RunnerResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> RunnerResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, blob: &[u8]) -> RunnerResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), blob.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> RunnerResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> RunnerResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_listing_is_ordered() {
        let store = InMemoryCacheStore::new();
        store.put("profile:b", b"{}").unwrap();
        store.put("profile:a", b"{}").unwrap();
        store.put("bots:a", b"{}").unwrap();

        assert_eq!(
            store.keys_with_prefix("profile:").unwrap(),
            vec!["profile:a".to_string(), "profile:b".to_string()]
        );
        store.delete("profile:a").unwrap();
        assert_eq!(store.get("profile:a").unwrap(), None);
        assert_eq!(store.len(), 2);
    }
}
