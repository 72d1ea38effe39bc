//! JSON-file-backed key-value store.
//!
//! [`KvStore`] keeps the whole map in memory and rewrites the backing file
//! synchronously after every mutation, so a process restart mid-job does not
//! lose state. Write failures are logged and the mutation proceeds in memory
//! only; they never propagate to the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::StoreError;

/// Shared persistent key-value store, partitioned by key prefix.
pub struct KvStore {
    /// `None` for an in-memory store (tests, ephemeral sessions).
    path: Option<PathBuf>,
    map: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl KvStore {
    /// Open (or create) the store backed by the given file.
    ///
    /// A malformed backing file is treated as empty: the store self-heals by
    /// starting fresh rather than refusing to load.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let map = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Store file is malformed, starting empty",
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            map: Mutex::new(map),
        })
    }

    /// Create a store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read and deserialize the value under `key`.
    ///
    /// A value that no longer deserializes into `T` is treated as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let map = self.map.lock().expect("kv store mutex poisoned");
        let value = map.get(key)?.clone();
        drop(map);

        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(key, error = %e, "Stored value is malformed, ignoring");
                None
            }
        }
    }

    /// Serialize and store `value` under `key`, persisting synchronously.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to serialize value for store");
                return;
            }
        };

        let mut map = self.map.lock().expect("kv store mutex poisoned");
        map.insert(key.to_string(), value);
        self.persist(&map);
    }

    /// Remove the value under `key`, persisting synchronously.
    pub fn remove(&self, key: &str) {
        let mut map = self.map.lock().expect("kv store mutex poisoned");
        if map.remove(key).is_some() {
            self.persist(&map);
        }
    }

    /// Rewrite the backing file from the current map.
    ///
    /// Failures are logged and otherwise ignored; the in-memory state is
    /// already updated and the next successful persist catches up.
    fn persist(&self, map: &BTreeMap<String, serde_json::Value>) {
        let Some(path) = &self.path else {
            return;
        };

        let json = match serde_json::to_string_pretty(map) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize store contents");
                return;
            }
        };

        if let Err(e) = std::fs::write(path, json) {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to persist store, continuing in memory",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_roundtrip() {
        let store = KvStore::in_memory();
        store.set("a", &42u32);
        assert_eq!(store.get::<u32>("a"), Some(42));

        store.remove("a");
        assert_eq!(store.get::<u32>("a"), None);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = KvStore::open(&path).unwrap();
            store.set("counter", &7u32);
        }

        let reopened = KvStore::open(&path).unwrap();
        assert_eq!(reopened.get::<u32>("counter"), Some(7));
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = KvStore::open(&path).unwrap();
        assert_eq!(store.get::<u32>("anything"), None);

        // The store is still usable after self-healing.
        store.set("anything", &1u32);
        assert_eq!(store.get::<u32>("anything"), Some(1));
    }

    #[test]
    fn type_mismatch_reads_as_absent() {
        let store = KvStore::in_memory();
        store.set("key", &"a string");
        assert_eq!(store.get::<u32>("key"), None);
    }
}
