//! Process-local storage, used by tests and embedders that persist nothing.

use crate::{validate_key, validate_segment, Storage, StorageError, StorageResult};
use crate::{WatchCallback, WatchGuard};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

type KeyPath = Vec<String>;
type Watchers = Mutex<HashMap<KeyPath, Vec<(u64, WatchCallback)>>>;

/// Values are kept as parsed JSON, so a read observes exactly what a
/// [`crate::JsonStorage`] round trip would.
#[derive(Default)]
pub struct MemoryStorage {
    values: RwLock<BTreeMap<KeyPath, Value>>,
    watchers: Arc<Watchers>,
    next_watch_id: AtomicU64,
}

fn owned(key: &[&str]) -> KeyPath {
    key.iter().map(|s| s.to_string()).collect()
}

fn lock(watchers: &Watchers) -> MutexGuard<'_, HashMap<KeyPath, Vec<(u64, WatchCallback)>>> {
    watchers.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn changed(&self, key: &KeyPath) {
        // Callbacks run without the lock so they may touch the storage.
        let callbacks: Vec<WatchCallback> = lock(&self.watchers)
            .get(key)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read<T: DeserializeOwned + Send>(&self, key: &[&str]) -> StorageResult<Option<T>> {
        validate_key(key)?;
        let value = self
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&owned(key))
            .cloned();
        match value {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StorageError::Shape {
                    key: key.join("/"),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize + Send + Sync>(
        &self,
        key: &[&str],
        value: &T,
    ) -> StorageResult<()> {
        validate_key(key)?;
        let value = serde_json::to_value(value).map_err(|source| StorageError::Encode {
            key: key.join("/"),
            source,
        })?;
        let path = owned(key);
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone(), value);
        self.changed(&path);
        Ok(())
    }

    async fn remove(&self, key: &[&str]) -> StorageResult<()> {
        validate_key(key)?;
        let path = owned(key);
        let removed = self
            .values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path)
            .is_some();
        if removed {
            self.changed(&path);
        }
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> StorageResult<Vec<Vec<String>>> {
        for segment in prefix {
            validate_segment(segment)?;
        }
        let start = owned(prefix);
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values
            .range(start.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&start))
            .filter(|key| key.len() == start.len() + 1)
            .cloned()
            .collect())
    }

    fn watch(&self, key: &[&str], on_change: WatchCallback) -> StorageResult<WatchGuard> {
        validate_key(key)?;
        let path = owned(key);
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.watchers)
            .entry(path.clone())
            .or_default()
            .push((id, on_change));

        let watchers = Arc::downgrade(&self.watchers);
        Ok(WatchGuard::from_fn(move || {
            let Some(watchers) = watchers.upgrade() else {
                return;
            };
            let mut watchers = lock(&watchers);
            if let Some(entries) = watchers.get_mut(&path) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    watchers.remove(&path);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_values_round_trip_as_json() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage
            .write(&["config", "server_states"], &json!({"fs": "RUNNING"}))
            .await
            .unwrap();
        let states: Option<HashMap<String, String>> =
            storage.read(&["config", "server_states"]).await.unwrap();
        assert_eq!(states.unwrap()["fs"], "RUNNING");

        let err = storage
            .read::<Vec<String>>(&["config", "server_states"])
            .await
            .unwrap_err();
        assert!(err.is_corrupt());

        storage.remove(&["config", "server_states"]).await.unwrap();
        storage.remove(&["config", "server_states"]).await.unwrap();
        assert_eq!(storage.len(), 0);
    }

    #[tokio::test]
    async fn test_list_excludes_nested_and_siblings() {
        let storage = MemoryStorage::new();
        storage.write(&["kv", "oauth_state_b"], &1).await.unwrap();
        storage.write(&["kv", "oauth_state_a"], &1).await.unwrap();
        storage.write(&["kv", "nested", "item"], &1).await.unwrap();
        storage.write(&["kvx", "item"], &1).await.unwrap();
        storage.write(&["config", "servers"], &1).await.unwrap();

        let keys = storage.list(&["kv"]).await.unwrap();
        assert_eq!(keys, vec![vec!["kv", "oauth_state_a"], vec!["kv", "oauth_state_b"]]);
        assert!(storage.list(&["missing"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_the_same_keys_as_files() {
        let storage = MemoryStorage::new();
        assert!(storage.write(&[], &1).await.is_err());
        assert!(storage.write(&["..", "x"], &1).await.is_err());
        assert!(storage.read::<u32>(&["a/b"]).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_fires_until_guard_dropped() {
        let storage = MemoryStorage::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let guard = storage
            .watch(
                &["config", "servers"],
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        storage.write(&["config", "servers"], &1).await.unwrap();
        storage.write(&["config", "other"], &1).await.unwrap();
        storage.remove(&["config", "servers"]).await.unwrap();
        storage.remove(&["config", "servers"]).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(guard);
        storage.write(&["config", "servers"], &2).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
