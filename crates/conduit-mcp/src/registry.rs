//! The server registry.
//!
//! Owns every [`ServerInstance`], persists the config set after each
//! mutation and routes state changes to the supervisor and token manager.
//!
//! ```text
//! Registry ── ServerManager ── ProcessAdapter / HttpAdapter
//!    │  └──── Supervisor (restart, health checks)
//!    └─────── TokenManager (refresh, authorization)
//! ```

use crate::browser::BrowserAdapter;
use crate::discovery::{self, AuthDiscovery, DiscoveryOptions};
use crate::error::{McpError, McpResult};
use crate::instance::ServerInstance;
use crate::listener::Subscription;
use crate::manager::{ServerManager, StartOptions, StopOptions};
use crate::parser;
use crate::protocol::{self, Capabilities};
use crate::server::{AuthConfig, OAuthConfig, ServerConfig, TransportConfig};
use crate::settings::OrchestratorSettings;
use crate::state::{HistoryEntry, MetadataPatch, ServerState, StateChange, StateEvent, StateMetadata};
use crate::store::ConfigStore;
use crate::supervisor::{Supervisor, SupervisorHooks};
use crate::token::{TokenEvent, TokenManager};
use crate::transport::{HttpAdapter, ProcessAdapter};
use async_trait::async_trait;
use conduit_storage::WatchGuard;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Config document holding the last-known state of each server.
pub const STATE_SNAPSHOT_NAME: &str = "server_states";

const EVENT_CAPACITY: usize = 1024;

/// Registry notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    ServerAdded {
        server_id: String,
    },
    ServerUpdated {
        server_id: String,
    },
    ServerRemoved {
        server_id: String,
    },
    StateChanged {
        server_id: String,
        from: ServerState,
        to: ServerState,
        event: StateEvent,
    },
    Started {
        server_id: String,
    },
    Stopped {
        server_id: String,
    },
    Error {
        server_id: String,
        state: ServerState,
        code: Option<String>,
        message: Option<String>,
    },
    CapabilitiesUpdated {
        server_id: String,
        tools: usize,
        resources: usize,
        prompts: usize,
    },
}

/// External collaborators.
#[derive(Clone)]
pub struct RegistryDeps {
    pub store: Arc<dyn ConfigStore>,
    pub process: Arc<dyn ProcessAdapter>,
    pub http: Arc<dyn HttpAdapter>,
    pub browser: Arc<dyn BrowserAdapter>,
    /// Used for discovery and token requests.
    pub http_client: reqwest::Client,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Overwrite servers whose id already exists instead of skipping them.
    pub replace_existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Default)]
struct Servers {
    map: HashMap<String, Arc<ServerInstance>>,
    order: Vec<String>,
}

impl Servers {
    fn get(&self, id: &str) -> Option<Arc<ServerInstance>> {
        self.map.get(id).cloned()
    }

    fn ordered(&self) -> Vec<Arc<ServerInstance>> {
        self.order.iter().filter_map(|id| self.map.get(id).cloned()).collect()
    }

    fn insert(&mut self, instance: Arc<ServerInstance>) {
        let id = instance.id().to_string();
        if self.map.insert(id.clone(), instance).is_none() {
            self.order.push(id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Arc<ServerInstance>> {
        let removed = self.map.remove(id);
        if removed.is_some() {
            self.order.retain(|o| o != id);
        }
        removed
    }
}

struct RegistryInner {
    store: Arc<dyn ConfigStore>,
    http_client: reqwest::Client,
    settings: OrchestratorSettings,
    manager: ServerManager,
    supervisor: Supervisor,
    tokens: TokenManager,
    servers: Mutex<Servers>,
    state_subscriptions: Mutex<HashMap<String, Subscription>>,
    token_subscription: Mutex<Option<Subscription>>,
    watch_guard: Mutex<Option<WatchGuard>>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<RegistryEvent>,
    /// Held while the in-memory set and the persisted set may differ.
    persist_lock: tokio::sync::Mutex<()>,
    snapshot_lock: tokio::sync::Mutex<()>,
    loaded: AtomicBool,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct RegistryHooks {
    registry: Weak<RegistryInner>,
}

impl RegistryHooks {
    fn registry(&self) -> McpResult<Registry> {
        self.registry
            .upgrade()
            .map(|inner| Registry { inner })
            .ok_or_else(|| McpError::InvalidState("registry disposed".to_string()))
    }
}

#[async_trait]
impl SupervisorHooks for RegistryHooks {
    async fn restart(&self, server_id: &str) -> McpResult<()> {
        // START is accepted from CRASHED, so no stop is needed first.
        self.registry()?.start_server(server_id).await
    }

    async fn health_check(&self, server_id: &str) -> McpResult<()> {
        let registry = self.registry()?;
        let instance = registry.instance(server_id)?;
        let handle = instance
            .handle()
            .ok_or_else(|| McpError::ConnectionClosed(format!("server '{server_id}' has no transport")))?;
        let result = protocol::ping(handle.as_ref()).await;
        drop(handle);
        match result {
            Err(e) if e.is_auth_required() => {
                registry.inner.manager.auth_lost(&instance, &e).await?;
                Err(e)
            }
            result => result,
        }
    }
}

/// Registry of configured servers.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(deps: RegistryDeps, settings: OrchestratorSettings) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let tokens = TokenManager::new(
                deps.http_client.clone(),
                deps.store.clone(),
                deps.browser.clone(),
                &settings,
            );
            let manager = ServerManager::new(
                deps.process.clone(),
                deps.http.clone(),
                tokens.clone(),
                settings.manager.clone(),
            );
            let hooks = Arc::new(RegistryHooks {
                registry: weak.clone(),
            });
            let (events, _) = broadcast::channel(EVENT_CAPACITY);

            RegistryInner {
                store: deps.store.clone(),
                http_client: deps.http_client.clone(),
                supervisor: Supervisor::new(settings.supervisor.clone(), hooks),
                manager,
                tokens,
                settings,
                servers: Mutex::new(Servers::default()),
                state_subscriptions: Mutex::new(HashMap::new()),
                token_subscription: Mutex::new(None),
                watch_guard: Mutex::new(None),
                reconcile_task: Mutex::new(None),
                events,
                persist_lock: tokio::sync::Mutex::new(()),
                snapshot_lock: tokio::sync::Mutex::new(()),
                loaded: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Load persisted servers, restore their states, watch the store and
    /// start every enabled server.
    pub async fn initialize(&self) -> McpResult<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _timing = conduit_util::TimingGuard::new("initialize", "registry");

        self.load().await?;
        self.inner.supervisor.start_health_checks();

        for (id, e) in self.start_all().await {
            warn!(server = %id, code = e.code(), error = %e, "Server did not start");
        }
        Ok(())
    }

    /// Load configs, restore persisted states and watch the store, without
    /// starting anything.
    pub async fn load(&self) -> McpResult<()> {
        if self.inner.loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.tokens.initialize().await?;
        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.tokens.on_refresh(move |event| {
            if let Some(inner) = weak.upgrade() {
                on_token_event(&inner, event);
            }
        });
        *lock(&self.inner.token_subscription) = Some(subscription);

        let configs = self.load_configs().await?;
        let snapshot = self.load_state_snapshot().await;
        for config in configs {
            let id = config.id.clone();
            if lock(&self.inner.servers).map.contains_key(&id) {
                continue;
            }
            let instance = self.insert_instance(config);
            if let Some(previous) = snapshot.get(&id) {
                restore_state(&instance, *previous);
            }
        }
        info!(servers = self.len(), "Registry loaded");

        self.watch_store()
    }

    /// Stop everything and release watchers, timers and subscriptions.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.watch_guard).take();
        if let Some(task) = lock(&self.inner.reconcile_task).take() {
            task.abort();
        }
        self.inner.supervisor.dispose();
        lock(&self.inner.token_subscription).take();
        self.inner.tokens.dispose();

        self.stop_all().await;
        if self.inner.loaded.load(Ordering::SeqCst) {
            let _persist = self.inner.persist_lock.lock().await;
            if let Err(e) = self.persist_locked().await {
                warn!(error = %e, "Could not persist servers on dispose");
            }
        }
        self.write_state_snapshot().await;
        lock(&self.inner.state_subscriptions).clear();
        debug!("Registry disposed");
    }

    // Queries

    pub fn len(&self) -> usize {
        lock(&self.inner.servers).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<ServerConfig> {
        lock(&self.inner.servers).get(id).map(|i| i.config())
    }

    /// Configs in insertion order.
    pub fn list(&self) -> Vec<ServerConfig> {
        lock(&self.inner.servers)
            .ordered()
            .iter()
            .map(|i| i.config())
            .collect()
    }

    pub fn state(&self, id: &str) -> McpResult<ServerState> {
        Ok(self.instance(id)?.state())
    }

    pub fn metadata(&self, id: &str) -> McpResult<StateMetadata> {
        Ok(self.instance(id)?.machine().metadata())
    }

    pub fn history(&self, id: &str) -> McpResult<Vec<HistoryEntry>> {
        Ok(self.instance(id)?.machine().history())
    }

    pub fn capabilities(&self, id: &str) -> McpResult<Option<Capabilities>> {
        Ok(self.instance(id)?.capabilities())
    }

    fn instance(&self, id: &str) -> McpResult<Arc<ServerInstance>> {
        lock(&self.inner.servers)
            .get(id)
            .ok_or_else(|| McpError::ServerNotFound(id.to_string()))
    }

    // Mutations

    pub async fn add(&self, config: ServerConfig) -> McpResult<()> {
        if config.id.trim().is_empty() {
            return Err(McpError::MissingId);
        }
        let _persist = self.inner.persist_lock.lock().await;
        if lock(&self.inner.servers).map.contains_key(&config.id) {
            return Err(McpError::DuplicateServer(config.id));
        }
        let id = config.id.clone();
        self.insert_instance(config);
        self.persist_locked().await?;

        info!(server = %id, "Server added");
        self.emit(RegistryEvent::ServerAdded { server_id: id });
        Ok(())
    }

    /// Replace a server's config. A changed transport stops the server first.
    pub async fn update(&self, id: &str, config: ServerConfig) -> McpResult<()> {
        if config.id != id {
            return Err(McpError::invalid_config(format!(
                "Cannot change server id from '{id}' to '{}'",
                config.id
            )));
        }
        let instance = self.instance(id)?;
        if instance.config().transport != config.transport && instance.state() != ServerState::Idle {
            self.inner
                .manager
                .stop(&instance, StopOptions::forced())
                .await?;
        }

        let _persist = self.inner.persist_lock.lock().await;
        instance.set_config(config);
        self.persist_locked().await?;

        info!(server = %id, "Server updated");
        self.emit(RegistryEvent::ServerUpdated {
            server_id: id.to_string(),
        });
        Ok(())
    }

    /// Force-stop and delete a server.
    pub async fn remove(&self, id: &str) -> McpResult<()> {
        let instance = self.instance(id)?;
        if let Err(e) = self.inner.manager.stop(&instance, StopOptions::forced()).await {
            warn!(server = %id, error = %e, "Error stopping removed server");
        }

        let _persist = self.inner.persist_lock.lock().await;
        self.detach(id);
        self.persist_locked().await?;

        info!(server = %id, "Server removed");
        self.emit(RegistryEvent::ServerRemoved {
            server_id: id.to_string(),
        });
        Ok(())
    }

    /// Parse a config document and add its servers.
    pub async fn import(&self, content: &str, options: ImportOptions) -> McpResult<ImportReport> {
        let configs = parser::parse(content)?;
        let mut report = ImportReport::default();

        for config in configs {
            let id = config.id.clone();
            match self.add(config.clone()).await {
                Ok(()) => report.added.push(id),
                Err(McpError::DuplicateServer(_)) if options.replace_existing => {
                    self.update(&id, config).await?;
                    report.updated.push(id);
                }
                Err(McpError::DuplicateServer(_)) => {
                    debug!(server = %id, "Skipping existing server");
                    report.skipped.push(id);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            skipped = report.skipped.len(),
            "Import complete"
        );
        Ok(report)
    }

    // Lifecycle

    pub async fn start_server(&self, id: &str) -> McpResult<()> {
        let instance = self.instance(id)?;
        self.inner
            .manager
            .start(&instance, StartOptions::default())
            .await?;
        self.emit_capabilities(&instance);
        Ok(())
    }

    pub async fn stop_server(&self, id: &str) -> McpResult<()> {
        let instance = self.instance(id)?;
        self.inner
            .manager
            .stop(&instance, StopOptions::default())
            .await
    }

    pub async fn restart_server(&self, id: &str) -> McpResult<()> {
        let instance = self.instance(id)?;
        self.inner.manager.restart(&instance).await?;
        self.emit_capabilities(&instance);
        Ok(())
    }

    /// Start every enabled server concurrently. Returns the failures.
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let enabled: Vec<String> = self
            .list()
            .into_iter()
            .filter(|c| c.enabled)
            .map(|c| c.id)
            .collect();

        let results = futures::future::join_all(enabled.iter().map(|id| self.start_server(id))).await;
        enabled
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    /// Force-stop every server concurrently.
    pub async fn stop_all(&self) {
        let instances = lock(&self.inner.servers).ordered();
        let stops = instances
            .iter()
            .map(|i| self.inner.manager.stop(i, StopOptions::forced()));
        for (instance, result) in instances.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!(server = %instance.id(), error = %e, "Error stopping server");
            }
        }
    }

    pub async fn refresh_capabilities(&self, id: &str) -> McpResult<Capabilities> {
        let instance = self.instance(id)?;
        let capabilities = match self.inner.manager.refresh_capabilities(&instance).await {
            Ok(capabilities) => capabilities,
            Err(e) if e.is_auth_required() => {
                self.inner.manager.auth_lost(&instance, &e).await?;
                return Err(McpError::AuthRequired(id.to_string()));
            }
            Err(e) => return Err(e),
        };
        self.emit_capabilities(&instance);
        Ok(capabilities)
    }

    // Authorization

    /// Discover the OAuth endpoints for an HTTP server and store them.
    pub async fn discover_auth(&self, id: &str) -> McpResult<AuthDiscovery> {
        let instance = self.instance(id)?;
        let config = instance.config();
        let url = config.url().ok_or_else(|| {
            McpError::invalid_config(format!("Server '{id}' is not an HTTP server"))
        })?;

        let existing = config.oauth().cloned().unwrap_or_default();
        let redirect_uri = existing
            .redirect_uri
            .clone()
            .unwrap_or_else(|| self.inner.settings.redirect_uri.clone());
        let found = discovery::discover(
            &self.inner.http_client,
            url,
            DiscoveryOptions {
                redirect_uri: &redirect_uri,
                client_name: &self.inner.settings.client_name,
                client_id: existing.client_id.as_deref(),
            },
        )
        .await?;

        let merged = merge_discovery(existing, &found);
        let _persist = self.inner.persist_lock.lock().await;
        instance.update_config(|c| c.auth = AuthConfig::OAuth(merged));
        self.persist_locked().await?;
        self.emit(RegistryEvent::ServerUpdated {
            server_id: id.to_string(),
        });
        Ok(found)
    }

    /// Run the browser authorization flow and store the tokens.
    pub async fn authenticate(&self, id: &str) -> McpResult<()> {
        let instance = self.instance(id)?;
        let config = instance.config();
        let discovered = config
            .oauth()
            .is_some_and(|o| o.authorization_endpoint.is_some() && o.token_endpoint.is_some());
        if !discovered {
            if !matches!(config.auth, AuthConfig::None | AuthConfig::OAuth(_)) {
                return Err(McpError::invalid_config(format!(
                    "Server '{id}' uses a static token"
                )));
            }
            self.discover_auth(id).await?;
        }

        let _op = instance.lock_operations().await;
        let machine = instance.machine();
        // Error states only accept RESET on the way to AUTHENTICATING.
        if machine.state().is_error()
            && !machine.transition(StateEvent::Reset, MetadataPatch::default())?
        {
            return Err(McpError::TransitionVetoed {
                server: id.to_string(),
                event: StateEvent::Reset,
            });
        }
        if !machine.transition(StateEvent::Authenticate, MetadataPatch::default())? {
            return Err(McpError::TransitionVetoed {
                server: id.to_string(),
                event: StateEvent::Authenticate,
            });
        }

        let config = instance.config();
        match self.inner.tokens.authenticate(&config).await {
            Ok(tokens) => {
                let persisted = {
                    let _persist = self.inner.persist_lock.lock().await;
                    instance.update_config(|c| {
                        if let AuthConfig::OAuth(oauth) = &mut c.auth {
                            oauth.tokens = Some(tokens);
                        }
                    });
                    self.persist_locked().await
                };
                if let Err(e) = persisted {
                    machine.transition(StateEvent::AuthFailed, MetadataPatch::from_error(&e))?;
                    return Err(e);
                }
                machine.transition(StateEvent::AuthSuccess, MetadataPatch::default())?;
                info!(server = %id, "Server authorized");
                Ok(())
            }
            Err(e) => {
                warn!(server = %id, code = e.code(), error = %e, "Authorization failed");
                machine.transition(StateEvent::AuthFailed, MetadataPatch::from_error(&e))?;
                Err(e)
            }
        }
    }

    // Internals

    fn insert_instance(&self, config: ServerConfig) -> Arc<ServerInstance> {
        let instance = Arc::new(ServerInstance::new(config, self.inner.settings.history_capacity));
        let id = instance.id().to_string();

        let weak = Arc::downgrade(&self.inner);
        let subscription = instance.machine().subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                on_state_change(&inner, change);
            }
        });
        lock(&self.inner.state_subscriptions).insert(id.clone(), subscription);
        lock(&self.inner.servers).insert(instance.clone());
        self.inner.supervisor.supervise(&id);
        instance
    }

    fn detach(&self, id: &str) -> Option<Arc<ServerInstance>> {
        self.inner.supervisor.unsupervise(id);
        self.inner.tokens.cancel_background_refresh(id);
        lock(&self.inner.state_subscriptions).remove(id);
        lock(&self.inner.servers).remove(id)
    }

    async fn load_configs(&self) -> McpResult<Vec<ServerConfig>> {
        let value = self
            .inner
            .store
            .read_config(&self.inner.settings.config_name)
            .await?;
        match value {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => match serde_json::from_value::<Vec<ServerConfig>>(value.clone()) {
                Ok(configs) => Ok(configs),
                // Hand-edited documents may use any importable shape.
                Err(_) => parser::parse_value(&value),
            },
        }
    }

    /// Write the whole config set. Callers hold `persist_lock`.
    async fn persist_locked(&self) -> McpResult<()> {
        let configs: Vec<ServerConfig> = self.list();
        let value = serde_json::to_value(&configs)?;
        self.inner
            .store
            .write_config(&self.inner.settings.config_name, &value)
            .await
    }

    async fn load_state_snapshot(&self) -> HashMap<String, ServerState> {
        match self.inner.store.read_config(STATE_SNAPSHOT_NAME).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring malformed state snapshot");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "Could not read state snapshot");
                HashMap::new()
            }
        }
    }

    async fn write_state_snapshot(&self) {
        write_state_snapshot(&self.inner).await;
    }

    fn watch_store(&self) -> McpResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let guard = self.inner.store.watch_config(
            &self.inner.settings.config_name,
            Arc::new(move || {
                let _ = tx.send(());
            }),
        )?;
        *lock(&self.inner.watch_guard) = Some(guard);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Collapse bursts of change notifications.
                while rx.try_recv().is_ok() {}
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = (Registry { inner }).reconcile().await {
                    warn!(error = %e, "Failed to reload server configs");
                }
            }
        });
        *lock(&self.inner.reconcile_task) = Some(task);
        Ok(())
    }

    /// Bring the in-memory set in line with the persisted one.
    ///
    /// Our own writes also trigger this; they leave nothing to do.
    pub async fn reconcile(&self) -> McpResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut to_start = Vec::new();
        let mut to_stop = Vec::new();
        let mut changed = Vec::new();

        {
            let _persist = self.inner.persist_lock.lock().await;
            let configs = self.load_configs().await?;
            let wanted: HashMap<&str, &ServerConfig> =
                configs.iter().map(|c| (c.id.as_str(), c)).collect();

            let current = lock(&self.inner.servers).ordered();
            for instance in &current {
                if !wanted.contains_key(instance.id()) {
                    let id = instance.id().to_string();
                    if let Some(removed) = self.detach(&id) {
                        to_stop.push(removed);
                    }
                    changed.push(RegistryEvent::ServerRemoved { server_id: id });
                }
            }

            for config in &configs {
                let existing = lock(&self.inner.servers).get(&config.id);
                match existing {
                    Some(instance) => {
                        let previous = instance.config();
                        if previous == *config {
                            continue;
                        }
                        if previous.transport != config.transport {
                            to_stop.push(instance.clone());
                            if config.enabled {
                                to_start.push(config.id.clone());
                            }
                        }
                        instance.set_config(config.clone());
                        changed.push(RegistryEvent::ServerUpdated {
                            server_id: config.id.clone(),
                        });
                    }
                    None => {
                        if config.enabled {
                            to_start.push(config.id.clone());
                        }
                        changed.push(RegistryEvent::ServerAdded {
                            server_id: config.id.clone(),
                        });
                    }
                }
                let known = lock(&self.inner.servers).map.contains_key(&config.id);
                if !known {
                    self.insert_instance(config.clone());
                }
            }
        }

        if !changed.is_empty() {
            info!(changes = changed.len(), "Server configs changed on disk");
        }
        for event in changed {
            self.emit(event);
        }
        for instance in to_stop {
            if let Err(e) = self.inner.manager.stop(&instance, StopOptions::forced()).await {
                warn!(server = %instance.id(), error = %e, "Error stopping server");
            }
        }
        for id in to_start {
            if let Err(e) = self.start_server(&id).await {
                warn!(server = %id, error = %e, "Server did not start");
            }
        }
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_capabilities(&self, instance: &ServerInstance) {
        if let Some(capabilities) = instance.capabilities() {
            self.emit(RegistryEvent::CapabilitiesUpdated {
                server_id: instance.id().to_string(),
                tools: capabilities.tools.len(),
                resources: capabilities.resources.len(),
                prompts: capabilities.prompts.len(),
            });
        }
    }
}

/// Running and in-flight states cannot survive a restart of the process.
fn restore_state(instance: &ServerInstance, previous: ServerState) {
    let machine = instance.machine();
    if previous == ServerState::Running || previous.is_transient() {
        machine.force_state(
            ServerState::Idle,
            MetadataPatch::default().with_extra("recovered_from", previous.as_str()),
        );
    } else if previous != ServerState::Idle {
        machine.force_state(previous, MetadataPatch::default().with_extra("restored", true));
    }
}

fn merge_discovery(mut oauth: OAuthConfig, found: &AuthDiscovery) -> OAuthConfig {
    oauth.authorization_endpoint = Some(found.authorization_endpoint.clone());
    oauth.token_endpoint = Some(found.token_endpoint.clone());
    if found.client_id.is_some() {
        oauth.client_id = found.client_id.clone();
        oauth.client_secret = found.client_secret.clone();
        oauth.registration_access_token = found.registration_access_token.clone();
    }
    if found.resource.is_some() {
        oauth.resource = found.resource.clone();
    }
    if oauth.scope.is_none() && !found.scopes_supported.is_empty() {
        oauth.scope = Some(found.scopes_supported.join(" "));
    }
    oauth
}

fn on_state_change(inner: &Arc<RegistryInner>, change: &StateChange) {
    let id = change.server_id.as_str();
    let emit = |event| {
        let _ = inner.events.send(event);
    };

    emit(RegistryEvent::StateChanged {
        server_id: id.to_string(),
        from: change.from,
        to: change.to,
        event: change.event,
    });

    match change.to {
        ServerState::Running => {
            if change.from == ServerState::Starting {
                emit(RegistryEvent::Started {
                    server_id: id.to_string(),
                });
                inner.supervisor.on_server_started(id);
                let config = lock(&inner.servers).get(id).map(|i| i.config());
                if let Some(config) = config {
                    inner.tokens.schedule_background_refresh(&config);
                }
            }
        }
        ServerState::Stopped => {
            emit(RegistryEvent::Stopped {
                server_id: id.to_string(),
            });
            inner.supervisor.on_server_stopped(id);
            inner.tokens.cancel_background_refresh(id);
        }
        ServerState::Crashed => {
            emit(error_event(change));
            inner.tokens.cancel_background_refresh(id);
            // A crash restored from the snapshot is not a fresh exit.
            if !change.forced {
                inner.supervisor.on_server_crashed(id, change.metadata.exit_code);
            }
        }
        ServerState::AuthRequired => {
            emit(error_event(change));
            inner.tokens.cancel_background_refresh(id);
            inner.supervisor.on_server_stopped(id);
        }
        to if to.is_error() => {
            emit(error_event(change));
            inner.tokens.cancel_background_refresh(id);
        }
        _ => {}
    }

    if !inner.disposed.load(Ordering::SeqCst) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                write_state_snapshot(&inner).await;
            }
        });
    }
}

fn error_event(change: &StateChange) -> RegistryEvent {
    RegistryEvent::Error {
        server_id: change.server_id.clone(),
        state: change.to,
        code: change.metadata.error_code.clone(),
        message: change.metadata.error_message.clone(),
    }
}

async fn write_state_snapshot(inner: &Arc<RegistryInner>) {
    let _snapshot = inner.snapshot_lock.lock().await;
    let states: HashMap<String, ServerState> = lock(&inner.servers)
        .ordered()
        .iter()
        .map(|i| (i.id().to_string(), i.state()))
        .collect();

    let value = match serde_json::to_value(&states) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "Could not encode state snapshot");
            return;
        }
    };
    if let Err(e) = inner.store.write_config(STATE_SNAPSHOT_NAME, &value).await {
        warn!(error = %e, "Could not persist state snapshot");
    }
}

fn on_token_event(inner: &Arc<RegistryInner>, event: &TokenEvent) {
    let Some(instance) = lock(&inner.servers).get(event.server_id()) else {
        return;
    };
    let machine = instance.machine();
    let state = machine.state();

    match event {
        TokenEvent::RefreshStarted { .. } => {
            if state == ServerState::Running {
                if let Err(e) = machine.transition(StateEvent::RefreshToken, MetadataPatch::default()) {
                    debug!(server = %instance.id(), error = %e, "Refresh started outside RUNNING");
                }
            }
        }
        TokenEvent::Refreshed { tokens, .. } => {
            let config = instance.update_config(|c| {
                if let AuthConfig::OAuth(oauth) = &mut c.auth {
                    oauth.tokens = Some(tokens.clone());
                }
            });
            if let Some(handle) = instance.handle() {
                if matches!(config.transport, TransportConfig::Http(_)) {
                    handle.set_bearer(&tokens.access_token);
                }
            }
            if state == ServerState::TokenRefreshing {
                if let Err(e) = machine.transition(StateEvent::TokenRefreshed, MetadataPatch::default()) {
                    warn!(server = %instance.id(), error = %e, "Could not leave TOKEN_REFRESHING");
                }
                inner.tokens.schedule_background_refresh(&config);
            }

            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let registry = Registry { inner };
                let _persist = registry.inner.persist_lock.lock().await;
                if let Err(e) = registry.persist_locked().await {
                    warn!(error = %e, "Could not persist refreshed tokens");
                }
            });
        }
        TokenEvent::RefreshFailed {
            still_valid,
            message,
            ..
        } => {
            if state != ServerState::TokenRefreshing {
                return;
            }
            if *still_valid {
                if let Err(e) = machine.transition(StateEvent::TokenRefreshed, MetadataPatch::default()) {
                    warn!(server = %instance.id(), error = %e, "Could not leave TOKEN_REFRESHING");
                }
                inner.tokens.schedule_refresh_retry(&instance.config());
                return;
            }
            if let Err(e) = machine.transition(
                StateEvent::RefreshFailed,
                MetadataPatch::error(message.clone(), "REFRESH_FAILED"),
            ) {
                warn!(server = %instance.id(), error = %e, "Could not record refresh failure");
            }
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.manager.disconnect(&instance).await {
                        warn!(server = %instance.id(), error = %e, "Error disconnecting server");
                    }
                }
            });
        }
    }
}
