//! OAuth token lifecycle for servers using [`AuthConfig::OAuth`].
//!
//! The token manager never owns server configs. Callers pass the current
//! [`ServerConfig`] in, and refreshed tokens flow back out through
//! [`TokenEvent`]s, which the registry writes into the config and persists.
//!
//! [`AuthConfig::OAuth`]: crate::server::AuthConfig::OAuth

use crate::browser::{BrowserAdapter, CallbackHandler, ProtocolHandlerGuard};
use crate::error::{McpError, McpResult};
use crate::listener::{Listeners, Subscription};
use crate::oauth::{
    exchange_code, flow_state_key, generate_state, refresh_tokens,
    AuthorizationRequest, ClientCredentials, OAuthFlowState, OAuthTokens, Pkce, FLOW_STATE_PREFIX,
};
use crate::server::{OAuthConfig, ServerConfig};
use crate::settings::{OrchestratorSettings, TokenManagerConfig};
use crate::store::ConfigStore;
use conduit_util::time::{now_ms, remaining_ms};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Refresh progress, observed by the registry.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    RefreshStarted {
        server_id: String,
    },
    Refreshed {
        server_id: String,
        tokens: OAuthTokens,
    },
    RefreshFailed {
        server_id: String,
        message: String,
        /// The previous access token has not expired yet.
        still_valid: bool,
    },
}

impl TokenEvent {
    pub fn server_id(&self) -> &str {
        match self {
            TokenEvent::RefreshStarted { server_id }
            | TokenEvent::Refreshed { server_id, .. }
            | TokenEvent::RefreshFailed { server_id, .. } => server_id,
        }
    }
}

struct PendingFlow {
    server_id: String,
    oauth: OAuthConfig,
    sender: oneshot::Sender<McpResult<OAuthTokens>>,
}

struct RefreshTimer {
    id: u64,
    cancel: CancellationToken,
}

struct TokenInner {
    http: reqwest::Client,
    store: Arc<dyn ConfigStore>,
    browser: Arc<dyn BrowserAdapter>,
    config: TokenManagerConfig,
    redirect_uri: String,
    pending: Mutex<HashMap<String, PendingFlow>>,
    timers: Mutex<HashMap<String, RefreshTimer>>,
    next_timer: AtomicU64,
    events: Listeners<TokenEvent>,
    handler: Mutex<Option<ProtocolHandlerGuard>>,
    registering: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives authorization, refresh and refresh scheduling.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        store: Arc<dyn ConfigStore>,
        browser: Arc<dyn BrowserAdapter>,
        settings: &OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                http,
                store,
                browser,
                config: settings.token.clone(),
                redirect_uri: settings.redirect_uri.clone(),
                pending: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(1),
                events: Listeners::new(),
                handler: Mutex::new(None),
                registering: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Drop expired or unreadable flow records.
    pub async fn initialize(&self) -> McpResult<()> {
        let purged = self.purge_expired_flows().await?;
        if purged > 0 {
            debug!(purged, "Removed expired OAuth flow records");
        }
        Ok(())
    }

    /// Route redirects to this manager. Registered on the first
    /// authorization and held until [`dispose`](Self::dispose).
    ///
    /// A handler that cannot be registered is logged; the flow then only
    /// completes through [`handle_callback`](Self::handle_callback).
    async fn ensure_redirect_handler(&self) {
        let _registering = self.inner.registering.lock().await;
        if lock(&self.inner.handler).is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handler: CallbackHandler = Arc::new(move |url: String| {
            let weak: Weak<TokenInner> = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => TokenManager { inner }.handle_callback(&url).await,
                    None => Err(McpError::InvalidState("token manager disposed".to_string())),
                }
            }
            .boxed()
        });

        match self
            .inner
            .browser
            .register_protocol_handler(&self.inner.redirect_uri, handler)
            .await
        {
            Ok(guard) => *lock(&self.inner.handler) = Some(guard),
            Err(e) => warn!(
                redirect_uri = %self.inner.redirect_uri,
                error = %e,
                "OAuth redirect handler unavailable"
            ),
        }
    }

    async fn purge_expired_flows(&self) -> McpResult<usize> {
        let now = now_ms();
        let mut purged = 0;
        for key in self.inner.store.keys(FLOW_STATE_PREFIX).await? {
            let expired = match self.inner.store.read(&key).await? {
                Some(value) => serde_json::from_value::<OAuthFlowState>(value)
                    .map(|flow| flow.is_expired_at(now))
                    .unwrap_or(true),
                None => false,
            };
            if expired {
                self.inner.store.delete(&key).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Listen for refresh progress.
    pub fn on_refresh(&self, listener: impl Fn(&TokenEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(listener)
    }

    /// Whether the user must authorize before `server` can start.
    pub fn needs_auth(&self, server: &ServerConfig) -> bool {
        match server.oauth() {
            None => false,
            Some(oauth) => match &oauth.tokens {
                None => true,
                Some(tokens) => tokens.is_expired() && tokens.refresh_token.is_none(),
            },
        }
    }

    /// A usable access token, refreshing when expired or close to expiry.
    ///
    /// Near expiry a failed refresh falls back to the current token.
    pub async fn ensure_valid_token(&self, server: &ServerConfig) -> McpResult<OAuthTokens> {
        let oauth = require_oauth(server)?;
        let tokens = oauth
            .tokens
            .clone()
            .ok_or_else(|| McpError::AuthRequired(server.id.clone()))?;

        let now = now_ms();
        if tokens.is_expired_at(now) {
            if tokens.refresh_token.is_none() {
                return Err(McpError::TokenExpired(server.id.clone()));
            }
            return self.refresh(server).await;
        }

        let buffer = self.inner.config.refresh_buffer_ms as i64;
        let near_expiry = tokens.expires_in_ms(now).is_some_and(|left| left <= buffer);
        if near_expiry && tokens.refresh_token.is_some() {
            match self.refresh(server).await {
                Ok(fresh) => return Ok(fresh),
                Err(e) => warn!(
                    server = %server.id,
                    error = %e,
                    "Token refresh failed, using current token until it expires"
                ),
            }
        }
        Ok(tokens)
    }

    /// Exchange the refresh token for new tokens.
    pub async fn refresh(&self, server: &ServerConfig) -> McpResult<OAuthTokens> {
        let oauth = require_oauth(server)?;
        let current = oauth.tokens.as_ref();
        let refresh_token = current
            .and_then(|t| t.refresh_token.as_deref())
            .ok_or_else(|| McpError::AuthRequired(server.id.clone()))?;
        let failed = |message: &str| McpError::RefreshFailed {
            server: server.id.clone(),
            message: message.to_string(),
        };
        let token_endpoint = oauth
            .token_endpoint
            .as_deref()
            .ok_or_else(|| failed("No token endpoint configured"))?;
        let client_id = oauth
            .client_id
            .as_deref()
            .ok_or_else(|| failed("No client id configured"))?;

        self.emit(TokenEvent::RefreshStarted {
            server_id: server.id.clone(),
        });

        let credentials = ClientCredentials {
            client_id,
            client_secret: oauth.client_secret.as_deref(),
        };
        match refresh_tokens(
            &self.inner.http,
            &server.id,
            token_endpoint,
            credentials,
            refresh_token,
        )
        .await
        {
            Ok(tokens) => {
                info!(
                    server = %server.id,
                    has_refresh_token = tokens.refresh_token.is_some(),
                    "Access token refreshed"
                );
                self.emit(TokenEvent::Refreshed {
                    server_id: server.id.clone(),
                    tokens: tokens.clone(),
                });
                Ok(tokens)
            }
            Err(e) => {
                self.emit(TokenEvent::RefreshFailed {
                    server_id: server.id.clone(),
                    message: e.to_string(),
                    still_valid: current.is_some_and(|t| !t.is_expired()),
                });
                Err(e)
            }
        }
    }

    /// Run the authorization-code flow with PKCE and wait for the redirect.
    pub async fn authenticate(&self, server: &ServerConfig) -> McpResult<OAuthTokens> {
        let oauth = require_oauth(server)?;
        let missing = |what: &str| {
            McpError::DiscoveryFailed(format!("No {what} known for server '{}'", server.id))
        };
        let auth_endpoint = oauth
            .authorization_endpoint
            .as_deref()
            .ok_or_else(|| missing("authorization endpoint"))?;
        if oauth.token_endpoint.is_none() {
            return Err(missing("token endpoint"));
        }
        let client_id = oauth.client_id.as_deref().ok_or_else(|| missing("client id"))?;

        let pkce = Pkce::generate();
        let flow = OAuthFlowState {
            state: generate_state(),
            code_verifier: pkce.verifier.clone(),
            server_id: server.id.clone(),
            expires_at: now_ms() + self.inner.config.flow_timeout_ms as i64,
            redirect_uri: oauth
                .redirect_uri
                .clone()
                .unwrap_or_else(|| self.inner.redirect_uri.clone()),
        };
        self.ensure_redirect_handler().await;
        let key = flow.key();
        self.inner
            .store
            .write(&key, &serde_json::to_value(&flow)?)
            .await?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(
            flow.state.clone(),
            PendingFlow {
                server_id: server.id.clone(),
                oauth: oauth.clone(),
                sender: tx,
            },
        );

        let result = async {
            let url = AuthorizationRequest {
                client_id,
                redirect_uri: &flow.redirect_uri,
                scope: oauth.scope.as_deref(),
                state: &flow.state,
                code_challenge: &pkce.challenge,
                resource: oauth.resource.as_deref(),
            }
            .url(auth_endpoint)?;

            info!(server = %server.id, "Waiting for browser authorization");
            self.inner.browser.open(&url).await?;

            match tokio::time::timeout(self.inner.config.flow_timeout(), rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(McpError::InvalidState(format!(
                    "authorization for '{}' was cancelled",
                    server.id
                ))),
                Err(_) => Err(McpError::FlowTimeout(server.id.clone())),
            }
        }
        .await;

        lock(&self.inner.pending).remove(&flow.state);
        if let Err(e) = self.inner.store.delete(&key).await {
            warn!(server = %server.id, error = %e, "Failed to remove OAuth flow record");
        }

        if result.is_ok() {
            info!(server = %server.id, "Authorization complete");
        }
        result
    }

    /// Complete a flow from the redirect the browser was sent to.
    pub async fn handle_callback(&self, callback_url: &str) -> McpResult<()> {
        let url = url::Url::parse(callback_url)
            .map_err(|e| McpError::InvalidCallback(format!("Malformed callback URL: {e}")))?;
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        let state = params
            .get("state")
            .cloned()
            .ok_or_else(|| McpError::InvalidCallback("Missing state parameter".to_string()))?;

        if let Some(error) = params.get("error") {
            let message = params
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| error.clone());
            let message = format!("Authorization denied: {message}");
            self.fail_pending(&state, McpError::InvalidCallback(message.clone()));
            return Err(McpError::InvalidCallback(message));
        }

        let code = params
            .get("code")
            .cloned()
            .ok_or_else(|| McpError::InvalidCallback("Missing authorization code".to_string()))?;

        let key = flow_state_key(&state);
        let flow: OAuthFlowState = match self.inner.store.read(&key).await? {
            Some(value) => serde_json::from_value(value)?,
            None => return Err(McpError::InvalidState(state)),
        };
        if flow.is_expired_at(now_ms()) {
            self.inner.store.delete(&key).await?;
            self.fail_pending(&state, McpError::FlowTimeout(flow.server_id.clone()));
            return Err(McpError::InvalidState(state));
        }

        let pending = lock(&self.inner.pending)
            .remove(&state)
            .filter(|p| p.server_id == flow.server_id)
            .ok_or_else(|| McpError::InvalidState(state.clone()))?;

        let oauth = &pending.oauth;
        let credentials = ClientCredentials {
            client_id: oauth.client_id.as_deref().unwrap_or_default(),
            client_secret: oauth.client_secret.as_deref(),
        };
        let result = exchange_code(
            &self.inner.http,
            oauth.token_endpoint.as_deref().unwrap_or_default(),
            credentials,
            &code,
            &flow.redirect_uri,
            &flow.code_verifier,
        )
        .await;

        let reply = match &result {
            Ok(tokens) => Ok(tokens.clone()),
            Err(McpError::CodeExchangeFailed(message)) => {
                Err(McpError::CodeExchangeFailed(message.clone()))
            }
            Err(other) => Err(McpError::CodeExchangeFailed(other.to_string())),
        };
        let _ = pending.sender.send(reply);
        result.map(|_| ())
    }

    fn fail_pending(&self, state: &str, error: McpError) {
        if let Some(pending) = lock(&self.inner.pending).remove(state) {
            let _ = pending.sender.send(Err(error));
        }
    }

    /// Refresh `server`'s tokens shortly before they expire.
    ///
    /// Replaces any timer already scheduled for the server. Returns whether a
    /// timer was scheduled.
    pub fn schedule_background_refresh(&self, server: &ServerConfig) -> bool {
        if self.inner.disposed.load(Ordering::SeqCst) || !self.inner.config.background_refresh {
            return false;
        }
        let expires_at = server
            .oauth()
            .and_then(|o| o.tokens.as_ref())
            .filter(|t| t.refresh_token.is_some())
            .and_then(|t| t.expires_at);
        let Some(expires_at) = expires_at else {
            self.cancel_background_refresh(&server.id);
            return false;
        };

        let buffer = self.inner.config.refresh_buffer_ms as i64;
        let delay = Duration::from_millis(remaining_ms(expires_at - buffer));
        self.schedule_refresh_after(server, delay);
        true
    }

    /// Retry a failed refresh while the current token still works.
    ///
    /// Fires after the configured retry delay, or at expiry if that comes
    /// first. Returns whether a timer was scheduled.
    pub fn schedule_refresh_retry(&self, server: &ServerConfig) -> bool {
        if self.inner.disposed.load(Ordering::SeqCst) || !self.inner.config.background_refresh {
            return false;
        }
        let expires_at = server
            .oauth()
            .and_then(|o| o.tokens.as_ref())
            .filter(|t| t.refresh_token.is_some())
            .and_then(|t| t.expires_at);
        let Some(expires_at) = expires_at else {
            self.cancel_background_refresh(&server.id);
            return false;
        };

        let delay = self
            .inner
            .config
            .refresh_retry()
            .min(Duration::from_millis(remaining_ms(expires_at)));
        self.schedule_refresh_after(server, delay);
        true
    }

    fn schedule_refresh_after(&self, server: &ServerConfig, delay: Duration) {
        let id = self.inner.next_timer.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        if let Some(previous) = lock(&self.inner.timers).insert(
            server.id.clone(),
            RefreshTimer {
                id,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }
        debug!(server = %server.id, delay_ms = delay.as_millis() as u64, "Scheduled token refresh");

        let weak = Arc::downgrade(&self.inner);
        let server = server.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut timers = lock(&inner.timers);
                match timers.get(&server.id) {
                    Some(timer) if timer.id == id => {
                        timers.remove(&server.id);
                    }
                    _ => return,
                }
            }
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = (TokenManager { inner }).refresh(&server).await {
                warn!(server = %server.id, error = %e, "Background token refresh failed");
            }
        });
    }

    pub fn cancel_background_refresh(&self, server_id: &str) {
        if let Some(timer) = lock(&self.inner.timers).remove(server_id) {
            timer.cancel.cancel();
        }
    }

    pub fn has_background_refresh(&self, server_id: &str) -> bool {
        lock(&self.inner.timers).contains_key(server_id)
    }

    /// Cancel timers, fail pending flows and release the redirect handler.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        for (_, timer) in lock(&self.inner.timers).drain() {
            timer.cancel.cancel();
        }
        let pending: Vec<PendingFlow> = lock(&self.inner.pending).drain().map(|(_, p)| p).collect();
        for flow in pending {
            let _ = flow.sender.send(Err(McpError::InvalidState(format!(
                "authorization for '{}' was cancelled",
                flow.server_id
            ))));
        }
        lock(&self.inner.handler).take();
        self.inner.events.clear();
    }

    fn emit(&self, event: TokenEvent) {
        self.inner.events.notify(&event);
    }
}

fn require_oauth(server: &ServerConfig) -> McpResult<&OAuthConfig> {
    server
        .oauth()
        .ok_or_else(|| McpError::invalid_config(format!("Server '{}' does not use OAuth", server.id)))
}
