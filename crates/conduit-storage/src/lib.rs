//! Storage layer for conduit.
//!
//! Values are JSON documents addressed by a short path of key segments,
//! e.g. `["config", "servers"]`. Two backends:
//! - [`JsonStorage`]: one file per key under a data directory
//! - [`MemoryStorage`]: process-local, for tests
//!
//! Both backends can notify a callback when a key changes, which is how the
//! orchestrator picks up server configs edited outside the process.

pub mod error;
pub mod json;
pub mod memory;
pub mod watch;

pub use error::{StorageError, StorageResult};
pub use json::JsonStorage;
pub use memory::MemoryStorage;
pub use watch::{WatchCallback, WatchGuard};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

#[async_trait]
pub trait Storage: Send + Sync {
    /// `None` when nothing is stored under `key`.
    async fn read<T: DeserializeOwned + Send>(&self, key: &[&str]) -> StorageResult<Option<T>>;

    /// Replace the value under `key`. Readers never observe a partial write.
    async fn write<T: Serialize + Send + Sync>(&self, key: &[&str], value: &T)
        -> StorageResult<()>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &[&str]) -> StorageResult<()>;

    /// Keys directly under `prefix`, as full paths, sorted.
    async fn list(&self, prefix: &[&str]) -> StorageResult<Vec<Vec<String>>>;

    /// Invoke `on_change` whenever the value at `key` is written or removed.
    ///
    /// Watching stops when the returned guard is dropped. The callback may
    /// run on a backend-owned thread and should hand real work off quickly.
    fn watch(&self, key: &[&str], on_change: WatchCallback) -> StorageResult<WatchGuard>;
}

/// Reject keys that could escape the storage root or collide with
/// temporary files.
pub(crate) fn validate_key(key: &[&str]) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::invalid_key("Key cannot be empty"));
    }
    for segment in key {
        validate_segment(segment)?;
    }
    Ok(())
}

pub(crate) fn validate_segment(segment: &str) -> StorageResult<()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.starts_with('.')
        || segment.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::invalid_key(format!(
            "Invalid key segment '{segment}'"
        )));
    }
    Ok(())
}
