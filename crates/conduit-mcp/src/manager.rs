//! Starting and stopping one server.
//!
//! The manager drives a [`ServerInstance`]'s state machine through the
//! validate, authorize, connect sequence and owns the exit watcher for the
//! transport it installs.

use crate::error::{McpError, McpResult};
use crate::instance::ServerInstance;
use crate::protocol;
use crate::server::{AuthConfig, ServerConfig, TransportConfig};
use crate::settings::ManagerConfig;
use crate::state::{MetadataPatch, ServerState, StateEvent};
use crate::token::TokenManager;
use crate::transport::{wait_for_exit, ExitStatus, HttpAdapter, ProcessAdapter, TransportHandle};
use chrono::Utc;
use conduit_util::TimingGuard;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Environment variable carrying the access token to stdio servers.
pub const ACCESS_TOKEN_ENV: &str = "MCP_ACCESS_TOKEN";

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Stop a running server first instead of returning early.
    pub force_restart: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Stop even when the state has no STOP edge.
    pub force: bool,
    /// Grace period before the transport is killed.
    pub timeout: Option<Duration>,
}

impl StopOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            timeout: None,
        }
    }
}

pub struct ServerManager {
    process: Arc<dyn ProcessAdapter>,
    http: Arc<dyn HttpAdapter>,
    tokens: TokenManager,
    config: ManagerConfig,
}

impl ServerManager {
    pub fn new(
        process: Arc<dyn ProcessAdapter>,
        http: Arc<dyn HttpAdapter>,
        tokens: TokenManager,
        config: ManagerConfig,
    ) -> Self {
        Self {
            process,
            http,
            tokens,
            config,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn start(&self, instance: &Arc<ServerInstance>, options: StartOptions) -> McpResult<()> {
        let _op = instance.lock_operations().await;
        self.start_locked(instance, options).await
    }

    pub async fn stop(&self, instance: &Arc<ServerInstance>, options: StopOptions) -> McpResult<()> {
        let _op = instance.lock_operations().await;
        self.stop_locked(instance, options).await
    }

    pub async fn restart(&self, instance: &Arc<ServerInstance>) -> McpResult<()> {
        let _op = instance.lock_operations().await;
        self.stop_locked(instance, StopOptions::forced()).await?;
        self.start_locked(instance, StartOptions::default()).await
    }

    /// End the transport without touching the state machine.
    pub async fn disconnect(&self, instance: &Arc<ServerInstance>) -> McpResult<()> {
        let _op = instance.lock_operations().await;
        instance.set_capabilities(None);
        match instance.take_handle() {
            Some(handle) => self.shutdown(&handle, self.config.stop_timeout()).await,
            None => Ok(()),
        }
    }

    /// The server rejected its credentials while connected. Moves RUNNING or
    /// TOKEN_REFRESHING to AUTH_REQUIRED and ends the transport.
    pub async fn auth_lost(&self, instance: &Arc<ServerInstance>, error: &McpError) -> McpResult<()> {
        let _op = instance.lock_operations().await;
        self.auth_lost_locked(instance, error).await
    }

    async fn auth_lost_locked(&self, instance: &Arc<ServerInstance>, error: &McpError) -> McpResult<()> {
        let event = match instance.state() {
            ServerState::Running => StateEvent::AuthRequired,
            ServerState::TokenRefreshing => StateEvent::RefreshFailed,
            state => {
                debug!(server = %instance.id(), state = %state, "Ignoring auth loss");
                return Ok(());
            }
        };
        warn!(server = %instance.id(), error = %error, "Server rejected credentials");
        self.apply(instance, event, MetadataPatch::from_error(error))?;
        instance.set_capabilities(None);
        match instance.take_handle() {
            Some(handle) => self.shutdown(&handle, self.config.stop_timeout()).await,
            None => Ok(()),
        }
    }

    /// Re-list tools, resources and prompts from the live transport.
    pub async fn refresh_capabilities(
        &self,
        instance: &Arc<ServerInstance>,
    ) -> McpResult<protocol::Capabilities> {
        let handle = instance
            .handle()
            .filter(|_| instance.state() == ServerState::Running)
            .ok_or_else(|| {
                McpError::ConnectionClosed(format!("server '{}' is not running", instance.id()))
            })?;
        let capabilities = protocol::fetch_capabilities(handle.as_ref()).await?;
        instance.set_capabilities(Some(capabilities.clone()));
        Ok(capabilities)
    }

    async fn start_locked(&self, instance: &Arc<ServerInstance>, options: StartOptions) -> McpResult<()> {
        let id = instance.id().to_string();
        let machine = instance.machine();

        if machine.state() == ServerState::Running {
            if !options.force_restart {
                debug!(server = %id, "Already running");
                return Ok(());
            }
            self.stop_locked(instance, StopOptions::forced()).await?;
        }

        let event = [StateEvent::Validate, StateEvent::Start]
            .into_iter()
            .find(|e| machine.can_transition(*e))
            .ok_or_else(|| McpError::InvalidTransition {
                server: id.clone(),
                from: machine.state(),
                event: StateEvent::Start,
            })?;
        self.apply(instance, event, MetadataPatch::default())?;

        let _timing = TimingGuard::server("start", &id);
        let config = instance.config();

        if let Err(e) = validate(&config) {
            warn!(server = %id, error = %e, "Invalid server configuration");
            self.apply(instance, StateEvent::Invalid, MetadataPatch::from_error(&e))?;
            return Err(e);
        }

        let bearer = match self.resolve_bearer(&config).await {
            Ok(bearer) => bearer,
            Err(e) if e.is_auth_required() || matches!(e, McpError::RefreshFailed { .. }) => {
                info!(server = %id, "Server needs authorization");
                let required = McpError::AuthRequired(id.clone());
                self.apply(instance, StateEvent::AuthRequired, MetadataPatch::from_error(&e))?;
                return Err(required);
            }
            Err(e) => {
                self.apply(instance, StateEvent::Error, MetadataPatch::from_error(&e))?;
                return Err(e);
            }
        };

        self.apply(instance, StateEvent::Valid, MetadataPatch::default())?;

        let startup = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.startup_timeout());
        let handle = match tokio::time::timeout(startup, self.connect(&config, bearer)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.fail_start(instance, e)),
            Err(_) => {
                let e = McpError::ProcessTimeout { server: id.clone() };
                return Err(self.fail_start(instance, e));
            }
        };

        let generation = instance.set_handle(handle.clone());
        spawn_exit_watcher(instance.clone(), handle.clone(), generation);
        spawn_stderr_logger(&id, handle.as_ref());

        let connected = MetadataPatch::default().with_extra("connected_at", Utc::now().to_rfc3339());
        self.apply(instance, StateEvent::Started, connected)?;
        info!(server = %id, transport = config.transport.kind(), "Server started");

        if self.config.fetch_capabilities {
            match protocol::fetch_capabilities(handle.as_ref()).await {
                Ok(capabilities) => {
                    debug!(
                        server = %id,
                        tools = capabilities.tools.len(),
                        resources = capabilities.resources.len(),
                        prompts = capabilities.prompts.len(),
                        "Fetched capabilities"
                    );
                    instance.set_capabilities(Some(capabilities));
                }
                Err(e) if e.is_auth_required() => {
                    self.auth_lost_locked(instance, &e).await?;
                    return Err(McpError::AuthRequired(id));
                }
                Err(e) => warn!(server = %id, error = %e, "Failed to fetch capabilities"),
            }
        }
        Ok(())
    }

    async fn stop_locked(&self, instance: &Arc<ServerInstance>, options: StopOptions) -> McpResult<()> {
        let id = instance.id().to_string();
        let machine = instance.machine();
        let state = machine.state();

        if matches!(state, ServerState::Idle | ServerState::Stopped) {
            return Ok(());
        }

        match machine.transition(StateEvent::Stop, MetadataPatch::default()) {
            Ok(true) => {}
            Ok(false) if !options.force => {
                return Err(McpError::TransitionVetoed {
                    server: id,
                    event: StateEvent::Stop,
                })
            }
            Err(e) if !options.force => return Err(e),
            _ => debug!(server = %id, from = %state, "Forcing stop"),
        }

        let timeout = options.timeout.unwrap_or_else(|| self.config.stop_timeout());
        instance.set_capabilities(None);
        let result = match instance.take_handle() {
            Some(handle) => self.shutdown(&handle, timeout).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                finish_stopped(instance, MetadataPatch::default());
                info!(server = %id, "Server stopped");
                Ok(())
            }
            Err(e) => {
                warn!(server = %id, error = %e, "Error while stopping server");
                machine.force_state(ServerState::Stopped, MetadataPatch::from_error(&e));
                Err(e)
            }
        }
    }

    /// Terminate, then kill once if the transport outlives `timeout`.
    async fn shutdown(&self, handle: &Arc<dyn TransportHandle>, timeout: Duration) -> McpResult<()> {
        let server = handle.server_id().to_string();
        let exit = handle.exit_receiver();

        if let Err(e) = handle.terminate().await {
            warn!(server = %server, error = %e, "Graceful shutdown failed, killing");
            return handle.kill().await;
        }

        match tokio::time::timeout(timeout, wait_for_exit(exit)).await {
            Ok(status) => {
                debug!(server = %server, code = ?status.code, "Transport exited");
                Ok(())
            }
            Err(_) => {
                warn!(
                    server = %server,
                    timeout_ms = timeout.as_millis() as u64,
                    "Server did not exit in time, killing"
                );
                handle.kill().await
            }
        }
    }

    async fn resolve_bearer(&self, config: &ServerConfig) -> McpResult<Option<String>> {
        match &config.auth {
            AuthConfig::None => Ok(None),
            AuthConfig::Token { token } => Ok(Some(token.clone())),
            AuthConfig::OAuth(_) => {
                if self.tokens.needs_auth(config) {
                    return Err(McpError::AuthRequired(config.id.clone()));
                }
                let tokens = self.tokens.ensure_valid_token(config).await?;
                Ok(Some(tokens.access_token))
            }
        }
    }

    async fn connect(
        &self,
        config: &ServerConfig,
        bearer: Option<String>,
    ) -> McpResult<Arc<dyn TransportHandle>> {
        match &config.transport {
            TransportConfig::Stdio(stdio) => {
                let mut stdio = stdio.clone();
                if let Some(token) = bearer {
                    stdio.env.insert(ACCESS_TOKEN_ENV.to_string(), token);
                }
                self.process.spawn(&config.id, &stdio).await
            }
            TransportConfig::Http(http) => self.http.connect(&config.id, http, bearer.as_deref()).await,
        }
    }

    fn fail_start(&self, instance: &ServerInstance, error: McpError) -> McpError {
        warn!(server = %instance.id(), code = error.code(), error = %error, "Failed to start server");
        if error.is_auth_required() {
            // STARTING has no AUTH_REQUIRED edge.
            instance
                .machine()
                .force_state(ServerState::AuthRequired, MetadataPatch::from_error(&error));
            return McpError::AuthRequired(instance.id().to_string());
        }
        if let Err(e) = self.apply(instance, StateEvent::Error, MetadataPatch::from_error(&error)) {
            debug!(server = %instance.id(), error = %e, "Could not record start failure");
        }
        error
    }

    fn apply(&self, instance: &ServerInstance, event: StateEvent, patch: MetadataPatch) -> McpResult<()> {
        if instance.machine().transition(event, patch)? {
            Ok(())
        } else {
            Err(McpError::TransitionVetoed {
                server: instance.id().to_string(),
                event,
            })
        }
    }
}

/// Check the config is structurally usable.
pub fn validate(config: &ServerConfig) -> McpResult<()> {
    if config.id.trim().is_empty() {
        return Err(McpError::MissingId);
    }
    match &config.transport {
        TransportConfig::Stdio(stdio) => {
            if stdio.command.trim().is_empty() {
                return Err(McpError::invalid_config(format!(
                    "Server '{}' has an empty command",
                    config.id
                )));
            }
        }
        TransportConfig::Http(http) => {
            let url = url::Url::parse(http.url.trim()).map_err(|e| {
                McpError::invalid_config(format!("Server '{}' has an invalid URL: {e}", config.id))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(McpError::invalid_config(format!(
                    "Server '{}' URL must be http or https",
                    config.id
                )));
            }
        }
    }
    Ok(())
}

fn finish_stopped(instance: &ServerInstance, patch: MetadataPatch) {
    let machine = instance.machine();
    if machine.state() == ServerState::Stopped {
        return;
    }
    if machine.can_transition(StateEvent::Stopped)
        && matches!(machine.transition(StateEvent::Stopped, patch.clone()), Ok(true))
    {
        return;
    }
    machine.force_state(ServerState::Stopped, patch);
}

fn spawn_exit_watcher(instance: Arc<ServerInstance>, handle: Arc<dyn TransportHandle>, generation: u64) {
    let exit = handle.exit_receiver();
    drop(handle);

    let span = conduit_util::server_span!(instance.id());
    tokio::spawn(
        async move {
            let status = wait_for_exit(exit).await;
            let _op = instance.lock_operations().await;

            let state = instance.state();
            if state == ServerState::Stopping || !state.is_active() {
                return;
            }
            if !instance.clear_handle_if(generation) {
                return;
            }
            record_exit(&instance, status);
        }
        .instrument(span),
    );
}

fn record_exit(instance: &ServerInstance, status: ExitStatus) {
    let machine = instance.machine();
    let id = instance.id();

    let (event, patch) = if status.is_crash() {
        let code = status.code.unwrap_or(ExitStatus::ABNORMAL_CODE);
        warn!(server = %id, code, "Server exited unexpectedly");
        let crash = McpError::ProcessCrashed {
            server: id.to_string(),
            code: status.code,
        };
        (
            StateEvent::Crashed,
            MetadataPatch::from_error(&crash).with_exit_code(status.code),
        )
    } else {
        info!(server = %id, "Server exited");
        (
            StateEvent::Stopped,
            MetadataPatch::default().with_exit_code(status.code),
        )
    };

    if machine.can_transition(event) {
        if let Err(e) = machine.transition(event, patch) {
            warn!(server = %id, error = %e, "Could not record server exit");
        }
    } else {
        machine.force_state(ServerState::Stopped, patch);
    }
}

fn spawn_stderr_logger(server_id: &str, handle: &dyn TransportHandle) {
    let Some(mut lines) = handle.take_stderr() else {
        return;
    };
    tokio::spawn(
        async move {
            while let Some(line) = lines.recv().await {
                debug!("stderr: {line}");
            }
        }
        .instrument(conduit_util::server_span!(server_id)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_stdio() {
        assert!(validate(&ServerConfig::stdio("fs", "mcp-fs", Vec::<String>::new())).is_ok());

        let err = validate(&ServerConfig::stdio("fs", "  ", Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig(_)));

        let err = validate(&ServerConfig::stdio("", "mcp-fs", Vec::<String>::new())).unwrap_err();
        assert!(matches!(err, McpError::MissingId));
    }

    #[test]
    fn test_validate_http() {
        assert!(validate(&ServerConfig::http("gh", "https://mcp.example.com/mcp")).is_ok());
        assert!(validate(&ServerConfig::http("gh", "")).is_err());
        assert!(validate(&ServerConfig::http("gh", "not a url")).is_err());
        assert!(validate(&ServerConfig::http("gh", "ftp://mcp.example.com")).is_err());
    }
}
