//! Runtime record for one configured server.

use crate::protocol::Capabilities;
use crate::server::ServerConfig;
use crate::state::{ServerState, StateMachine};
use crate::transport::TransportHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A server's config, state machine and live transport.
///
/// Every handle installed bumps the generation, so tasks watching an older
/// handle can tell they are stale.
pub struct ServerInstance {
    id: String,
    config: RwLock<ServerConfig>,
    machine: StateMachine,
    handle: Mutex<Option<Arc<dyn TransportHandle>>>,
    generation: AtomicU64,
    capabilities: RwLock<Option<Capabilities>>,
    operations: tokio::sync::Mutex<()>,
}

impl ServerInstance {
    pub fn new(config: ServerConfig, history_capacity: usize) -> Self {
        Self {
            id: config.id.clone(),
            machine: StateMachine::with_capacity(config.id.clone(), history_capacity),
            config: RwLock::new(config),
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            capabilities: RwLock::new(None),
            operations: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_config(&self, config: ServerConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Edit the config in place and return the result.
    pub fn update_config(&self, edit: impl FnOnce(&mut ServerConfig)) -> ServerConfig {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        edit(&mut config);
        config.clone()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn state(&self) -> ServerState {
        self.machine.state()
    }

    pub fn handle(&self) -> Option<Arc<dyn TransportHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a live handle and return its generation.
    pub(crate) fn set_handle(&self, handle: Arc<dyn TransportHandle>) -> u64 {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remove the handle, invalidating watchers of it.
    pub(crate) fn take_handle(&self) -> Option<Arc<dyn TransportHandle>> {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take()
    }

    /// Remove the handle only if it is still generation `generation`.
    pub(crate) fn clear_handle_if(&self, generation: u64) -> bool {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        *slot = None;
        true
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_capabilities(&self, capabilities: Option<Capabilities>) {
        *self.capabilities.write().unwrap_or_else(|e| e.into_inner()) = capabilities;
    }

    /// Serialize start, stop and restart for this server.
    pub(crate) async fn lock_operations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.operations.lock().await
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
