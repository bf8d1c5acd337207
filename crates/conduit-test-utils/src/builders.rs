//! Builders for registries, settings and server configs under test.

use crate::browser::RecordingBrowser;
use crate::store::memory_store;
use crate::transport::{FakeHttpAdapter, FakeProcessAdapter};
use conduit_mcp::{
    AuthConfig, ConfigStore, OAuthConfig, OAuthTokens, OrchestratorSettings, Registry,
    RegistryDeps, ServerConfig,
};
use std::sync::Arc;

/// Settings with short timers and no periodic health checks.
pub fn fast_settings() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::default();
    settings.supervisor.base_delay_ms = 10;
    settings.supervisor.max_delay_ms = 100;
    settings.supervisor.health_checks = false;
    settings.manager.startup_timeout_ms = 1_000;
    settings.manager.stop_timeout_ms = 100;
    settings.token.background_refresh = false;
    settings
}

pub fn stdio_server(id: &str) -> ServerConfig {
    ServerConfig::stdio(id, "mcp-server", ["--stdio"])
}

pub fn http_server(id: &str, url: &str) -> ServerConfig {
    ServerConfig::http(id, url)
}

/// An HTTP server using OAuth against `token_endpoint`.
pub fn oauth_server(id: &str, token_endpoint: &str, tokens: Option<OAuthTokens>) -> ServerConfig {
    ServerConfig::http(id, "https://mcp.example.com/mcp").with_auth(AuthConfig::OAuth(OAuthConfig {
        client_id: Some("test-client".to_string()),
        authorization_endpoint: Some("https://auth.example.com/authorize".to_string()),
        token_endpoint: Some(token_endpoint.to_string()),
        tokens,
        ..Default::default()
    }))
}

/// A registry wired to fakes the test can inspect.
pub struct TestHarness {
    pub registry: Registry,
    pub store: Arc<dyn ConfigStore>,
    pub process: Arc<FakeProcessAdapter>,
    pub http: Arc<FakeHttpAdapter>,
    pub browser: Arc<RecordingBrowser>,
}

impl TestHarness {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self::with_parts(settings, memory_store(), RecordingBrowser::new())
    }

    pub fn with_parts(
        settings: OrchestratorSettings,
        store: Arc<dyn ConfigStore>,
        browser: RecordingBrowser,
    ) -> Self {
        let process = Arc::new(FakeProcessAdapter::new());
        let http = Arc::new(FakeHttpAdapter::new());
        let browser = Arc::new(browser);
        let registry = Registry::new(
            RegistryDeps {
                store: store.clone(),
                process: process.clone(),
                http: http.clone(),
                browser: browser.clone(),
                http_client: reqwest::Client::new(),
            },
            settings,
        );
        Self {
            registry,
            store,
            process,
            http,
            browser,
        }
    }

    /// A second registry over the same store, as after a restart.
    pub fn reopen(&self, settings: OrchestratorSettings) -> Self {
        Self::with_parts(settings, self.store.clone(), RecordingBrowser::new())
    }
}
