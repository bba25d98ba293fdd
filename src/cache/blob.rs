use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::store::CacheStore;
use crate::error::{internal_error, RunnerResult};
use crate::logger::Logger;

static LOGGER: std::sync::LazyLock<Logger> =
    std::sync::LazyLock::new(|| Logger::new("@runner/cache"));

/// Envelope stored for every cached value.
///
/// `version` is the local version marker of the last optimistic write; `server_time` is the
/// remote update time of the last confirmed copy, if any. Freshness is judged by callers from
/// `cache_time`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBlob<T> {
    pub value: T,
    pub cache_time: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub server_time: Option<DateTime<Utc>>,
}

impl<T> CachedBlob<T> {
    pub fn new(value: T, cache_time: DateTime<Utc>) -> Self {
        Self {
            value,
            cache_time,
            version: 0,
            server_time: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_server_time(mut self, server_time: Option<DateTime<Utc>>) -> Self {
        self.server_time = server_time;
        self
    }

    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.cache_time <= max_age
    }
}

/// Typed access to a [`CacheStore`] with an in-memory mirror of the last known values.
///
/// Reads prefer the device store and fall back to the mirror when it fails. Writes update the
/// mirror first, so even a failed device write leaves the value readable for this session.
pub struct LocalCache {
    store: Arc<dyn CacheStore>,
    mirror: Mutex<HashMap<String, Value>>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("mirrored_keys", &self.mirror.lock().unwrap().len())
            .finish()
    }
}

impl LocalCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            mirror: Mutex::new(HashMap::new()),
        }
    }

    pub fn read<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let raw = match self.store.get(key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    self.mirror
                        .lock()
                        .unwrap()
                        .insert(key.to_owned(), value.clone());
                    Some(value)
                }
                Err(err) => {
                    LOGGER.warn(format!("discarding unreadable cache entry {key}: {err}"));
                    self.mirror.lock().unwrap().get(key).cloned()
                }
            },
            Ok(None) => None,
            Err(err) => {
                LOGGER.warn(format!("cache read failed for {key}, using memory copy: {err}"));
                self.mirror.lock().unwrap().get(key).cloned()
            }
        }?;

        match serde_json::from_value(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                LOGGER.warn(format!("cache entry {key} has an unexpected shape: {err}"));
                None
            }
        }
    }

    pub fn read_blob<T>(&self, key: &str) -> Option<CachedBlob<T>>
    where
        T: DeserializeOwned,
    {
        self.read(key)
    }

    /// Stores `value`. On device failure the memory copy is kept and `StorageFailure` returned.
    pub fn write<T>(&self, key: &str, value: &T) -> RunnerResult<()>
    where
        T: Serialize,
    {
        let json = serde_json::to_value(value)
            .map_err(|err| internal_error(format!("failed to encode cache entry {key}: {err}")))?;
        let bytes = serde_json::to_vec(&json)
            .map_err(|err| internal_error(format!("failed to encode cache entry {key}: {err}")))?;
        self.mirror.lock().unwrap().insert(key.to_owned(), json);
        self.store.put(key, &bytes)
    }

    pub fn write_blob<T>(&self, key: &str, blob: &CachedBlob<T>) -> RunnerResult<()>
    where
        T: Serialize,
    {
        self.write(key, blob)
    }

    pub fn remove(&self, key: &str) -> RunnerResult<()> {
        self.mirror.lock().unwrap().remove(key);
        self.store.delete(key)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        match self.store.keys_with_prefix(prefix) {
            Ok(keys) => keys,
            Err(err) => {
                LOGGER.warn(format!("cache listing failed for {prefix}: {err}"));
                let mut keys: Vec<String> = self
                    .mirror
                    .lock()
                    .unwrap()
                    .keys()
                    .filter(|key| key.starts_with(prefix))
                    .cloned()
                    .collect();
                keys.sort();
                keys
            }
        }
    }

    /// Removes every key starting with `prefix`, returning how many were removed.
    pub fn purge_prefix(&self, prefix: &str) -> usize {
        let keys = self.keys_with_prefix(prefix);
        let mut removed = 0;
        for key in keys {
            match self.remove(&key) {
                Ok(()) => removed += 1,
                Err(err) => LOGGER.warn(format!("failed to purge {key}: {err}")),
            }
        }
        self.mirror
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::error::storage_failure;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyStore {
        inner: InMemoryCacheStore,
        failing: AtomicBool,
    }

    impl CacheStore for FlakyStore {
        fn get(&self, key: &str) -> RunnerResult<Option<Vec<u8>>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(storage_failure("device unavailable"));
            }
            self.inner.get(key)
        }

        fn put(&self, key: &str, blob: &[u8]) -> RunnerResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(storage_failure("device unavailable"));
            }
            self.inner.put(key, blob)
        }

        fn delete(&self, key: &str) -> RunnerResult<()> {
            self.inner.delete(key)
        }

        fn keys_with_prefix(&self, prefix: &str) -> RunnerResult<Vec<String>> {
            self.inner.keys_with_prefix(prefix)
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, hour, 0, 0).unwrap()
    }

    #[test]
    fn blob_roundtrip_and_freshness() {
        let cache = LocalCache::new(Arc::new(InMemoryCacheStore::new()));
        let blob = CachedBlob::new(vec![3u32, 1, 2], at(10)).with_version(4);
        cache.write_blob("leaderboard:global", &blob).unwrap();

        let stored: CachedBlob<Vec<u32>> = cache.read_blob("leaderboard:global").unwrap();
        assert_eq!(stored, blob);
        assert!(stored.is_fresh(Duration::hours(1), at(11)));
        assert!(!stored.is_fresh(Duration::minutes(30), at(11)));
    }

    #[test]
    fn falls_back_to_memory_when_device_fails() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryCacheStore::new(),
            failing: AtomicBool::new(false),
        });
        let cache = LocalCache::new(store.clone());
        cache.write("profile:p1", &serde_json::json!({"level": 2})).unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let err = cache
            .write("profile:p1", &serde_json::json!({"level": 3}))
            .unwrap_err();
        assert_eq!(err.code_str(), "runner/storage-failure");

        let value: Value = cache.read("profile:p1").unwrap();
        assert_eq!(value["level"], 3);
    }

    #[test]
    fn purge_prefix_removes_matching_keys() {
        let cache = LocalCache::new(Arc::new(InMemoryCacheStore::new()));
        cache.write("leaderboard:global", &1).unwrap();
        cache.write("leaderboard:daily_20260504", &2).unwrap();
        cache.write("profile:p1", &3).unwrap();

        assert_eq!(cache.purge_prefix("leaderboard:"), 2);
        assert_eq!(cache.read::<u32>("leaderboard:global"), None);
        assert_eq!(cache.read::<u32>("profile:p1"), Some(3));
    }
}
