//! Persistence seam for the orchestrator.
//!
//! Two namespaces: named config documents (the server list, the state
//! snapshot) and a flat key/value space for short-lived records such as
//! in-flight OAuth flows.

use crate::error::McpResult;
use async_trait::async_trait;
use conduit_storage::{Storage, WatchCallback, WatchGuard};
use serde_json::Value;

/// JSON persistence used by the registry and token manager.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read_config(&self, name: &str) -> McpResult<Option<Value>>;

    async fn write_config(&self, name: &str, value: &Value) -> McpResult<()>;

    /// Call `on_change` when the named document changes outside this process.
    fn watch_config(&self, name: &str, on_change: WatchCallback) -> McpResult<WatchGuard>;

    async fn read(&self, key: &str) -> McpResult<Option<Value>>;

    async fn write(&self, key: &str, value: &Value) -> McpResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> McpResult<()>;

    /// Keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> McpResult<Vec<String>>;
}

const CONFIG_NS: &str = "config";
const KV_NS: &str = "kv";

/// Bridges any [`Storage`] backend.
///
/// Config documents live under `config/<name>`, key/value records under
/// `kv/<key>`.
#[derive(Debug, Clone)]
pub struct StoreAdapter<S> {
    storage: S,
}

impl<S: Storage> StoreAdapter<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}

#[async_trait]
impl<S: Storage> ConfigStore for StoreAdapter<S> {
    async fn read_config(&self, name: &str) -> McpResult<Option<Value>> {
        Ok(self.storage.read(&[CONFIG_NS, name]).await?)
    }

    async fn write_config(&self, name: &str, value: &Value) -> McpResult<()> {
        Ok(self.storage.write(&[CONFIG_NS, name], value).await?)
    }

    fn watch_config(&self, name: &str, on_change: WatchCallback) -> McpResult<WatchGuard> {
        Ok(self.storage.watch(&[CONFIG_NS, name], on_change)?)
    }

    async fn read(&self, key: &str) -> McpResult<Option<Value>> {
        Ok(self.storage.read(&[KV_NS, key]).await?)
    }

    async fn write(&self, key: &str, value: &Value) -> McpResult<()> {
        Ok(self.storage.write(&[KV_NS, key], value).await?)
    }

    async fn delete(&self, key: &str) -> McpResult<()> {
        Ok(self.storage.remove(&[KV_NS, key]).await?)
    }

    async fn keys(&self, prefix: &str) -> McpResult<Vec<String>> {
        let keys = self.storage.list(&[KV_NS]).await?;
        Ok(keys
            .into_iter()
            .filter_map(|mut path| path.pop())
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}
