use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::cache::store::CacheStore;
use crate::error::{storage_failure, RunnerResult};

const BLOB_EXTENSION: &str = "blob";

/// File-backed store: one file per key inside `root`.
///
/// Writes go to a temporary sibling, are fsynced, then renamed over the target, so a crash right
/// after `put` returns never leaves a truncated blob behind.
#[derive(Debug)]
pub struct FileCacheStore {
    root: PathBuf,
    write_guard: Mutex<()>,
}

impl FileCacheStore {
    pub fn open(root: impl AsRef<Path>) -> RunnerResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| {
            storage_failure(format!(
                "failed to create cache directory {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            write_guard: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        self.root.join(format!("{encoded}.{BLOB_EXTENSION}"))
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &str) -> RunnerResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_failure(format!("failed to read cache key {key}: {err}"))),
        }
    }

    fn put(&self, key: &str, blob: &[u8]) -> RunnerResult<()> {
        let _guard = self.write_guard.lock().unwrap();
        let target = self.path_for(key);
        let staging = target.with_extension("tmp");

        let mut file = File::create(&staging)
            .map_err(|err| storage_failure(format!("failed to create {key}: {err}")))?;
        file.write_all(blob)
            .map_err(|err| storage_failure(format!("failed to write {key}: {err}")))?;
        file.sync_all()
            .map_err(|err| storage_failure(format!("failed to sync {key}: {err}")))?;
        drop(file);

        fs::rename(&staging, &target)
            .map_err(|err| storage_failure(format!("failed to commit {key}: {err}")))
    }

    fn delete(&self, key: &str) -> RunnerResult<()> {
        let _guard = self.write_guard.lock().unwrap();
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_failure(format!("failed to delete {key}: {err}"))),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> RunnerResult<Vec<String>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|err| storage_failure(format!("failed to list cache directory: {err}")))?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| storage_failure(format!("failed to list cache entry: {err}")))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(encoded) = name.strip_suffix(&format!(".{BLOB_EXTENSION}")) else {
                continue;
            };
            let key = percent_decode_str(encoded).decode_utf8_lossy().into_owned();
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_root(name: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "runner-cache-{name}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ))
    }

    #[test]
    fn survives_reopen() {
        let root = temp_root("reopen");
        {
            let store = FileCacheStore::open(&root).unwrap();
            store.put("profile:player/1", br#"{"level":3}"#).unwrap();
            store.put("opqueue", b"[]").unwrap();
        }

        let store = FileCacheStore::open(&root).unwrap();
        assert_eq!(
            store.get("profile:player/1").unwrap().as_deref(),
            Some(br#"{"level":3}"#.as_slice())
        );
        assert_eq!(
            store.keys_with_prefix("profile:").unwrap(),
            vec!["profile:player/1".to_string()]
        );

        store.delete("profile:player/1").unwrap();
        store.delete("profile:player/1").unwrap();
        assert_eq!(store.get("profile:player/1").unwrap(), None);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_key_is_none() {
        let root = temp_root("missing");
        let store = FileCacheStore::open(&root).unwrap();
        assert_eq!(store.get("bots:nobody").unwrap(), None);
        let _ = fs::remove_dir_all(root);
    }
}
