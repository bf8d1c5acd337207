//! Config stores for tests.

use async_trait::async_trait;
use conduit_mcp::{ConfigStore, McpError, McpResult, StoreAdapter};
use conduit_storage::{MemoryStorage, StorageError, WatchCallback, WatchGuard};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A fresh in-memory store.
pub fn memory_store() -> Arc<dyn ConfigStore> {
    Arc::new(StoreAdapter::new(MemoryStorage::new()))
}

/// An in-memory store whose writes can be made to fail.
pub struct FailingStore {
    inner: StoreAdapter<MemoryStorage>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: StoreAdapter::new(MemoryStorage::new()),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Write attempts, including failed ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> McpResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only store");
            return Err(McpError::Storage(StorageError::io("failing-store", io)));
        }
        Ok(())
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for FailingStore {
    async fn read_config(&self, name: &str) -> McpResult<Option<Value>> {
        self.inner.read_config(name).await
    }

    async fn write_config(&self, name: &str, value: &Value) -> McpResult<()> {
        self.check_write()?;
        self.inner.write_config(name, value).await
    }

    fn watch_config(&self, name: &str, on_change: WatchCallback) -> McpResult<WatchGuard> {
        self.inner.watch_config(name, on_change)
    }

    async fn read(&self, key: &str) -> McpResult<Option<Value>> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, value: &Value) -> McpResult<()> {
        self.check_write()?;
        self.inner.write(key, value).await
    }

    async fn delete(&self, key: &str) -> McpResult<()> {
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> McpResult<Vec<String>> {
        self.inner.keys(prefix).await
    }
}
