//! Authorization, refresh and discovery against a mock authorization server.

use conduit_mcp::oauth::FLOW_STATE_PREFIX;
use conduit_mcp::{
    AuthConfig, BrowserAdapter, McpError, OAuthTokens, OrchestratorSettings, Registry,
    RegistryDeps, ReqwestHttpAdapter, ServerConfig, ServerState, StateEvent, TokenEvent,
    TokenManager,
};
use conduit_test_utils::{
    fast_settings, http_server, memory_store, oauth_server, FakeProcessAdapter, RecordingBrowser,
    TestHarness,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn went(registry: &Registry, id: &str, from: ServerState, to: ServerState, event: StateEvent) -> bool {
    registry
        .history(id)
        .unwrap()
        .iter()
        .any(|h| h.from == from && h.to == to && h.event == event)
}

fn refreshable(access: &str, expires_in_ms: i64) -> OAuthTokens {
    OAuthTokens {
        refresh_token: Some("refresh-1".to_string()),
        expires_at: Some(chrono::Utc::now().timestamp_millis() + expires_in_ms),
        ..OAuthTokens::bearer(access)
    }
}

fn token_response(access: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": "refresh-2",
    }))
}

#[tokio::test]
async fn test_token_near_expiry_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(token_response("access-2"))
        .expect(1)
        .mount(&server)
        .await;

    let settings = OrchestratorSettings::default();
    let browser: Arc<dyn BrowserAdapter> = Arc::new(RecordingBrowser::new());
    let manager = TokenManager::new(reqwest::Client::new(), memory_store(), browser, &settings);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _subscription = manager.on_refresh(move |event| {
        let name = match event {
            TokenEvent::RefreshStarted { .. } => "started",
            TokenEvent::Refreshed { .. } => "refreshed",
            TokenEvent::RefreshFailed { .. } => "failed",
        };
        sink.lock().unwrap().push(name);
    });

    let tokens = OAuthTokens {
        refresh_token: Some("refresh-1".to_string()),
        expires_at: Some(chrono::Utc::now().timestamp_millis() + 30_000),
        ..OAuthTokens::bearer("access-1")
    };
    let config = oauth_server("remote", &format!("{}/token", server.uri()), Some(tokens));

    let refreshed = manager.ensure_valid_token(&config).await.unwrap();
    assert_eq!(refreshed.access_token, "access-2");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-2"));
    assert!(refreshed.expires_at.unwrap() > chrono::Utc::now().timestamp_millis());
    assert_eq!(*events.lock().unwrap(), vec!["started", "refreshed"]);
}

#[tokio::test]
async fn test_rejected_refresh_of_expired_token_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    let settings = OrchestratorSettings::default();
    let browser: Arc<dyn BrowserAdapter> = Arc::new(RecordingBrowser::new());
    let manager = TokenManager::new(reqwest::Client::new(), memory_store(), browser, &settings);

    let tokens = OAuthTokens {
        refresh_token: Some("refresh-1".to_string()),
        expires_at: Some(chrono::Utc::now().timestamp_millis() - 1_000),
        ..OAuthTokens::bearer("access-1")
    };
    let config = oauth_server("remote", &format!("{}/token", server.uri()), Some(tokens));

    let err = manager.ensure_valid_token(&config).await.unwrap_err();
    assert!(
        matches!(err, McpError::RefreshFailed { ref server, .. } if server == "remote"),
        "unexpected error {err:?}"
    );
}

#[tokio::test]
async fn test_authenticate_then_start_with_new_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=the-code"))
        .and(body_string_contains("code_verifier="))
        .respond_with(token_response("access-1"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = TestHarness::with_parts(
        fast_settings(),
        memory_store(),
        RecordingBrowser::approving("the-code"),
    );
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server("remote", &format!("{}/token", server.uri()), None))
        .await
        .unwrap();

    harness.registry.authenticate("remote").await.unwrap();
    assert_eq!(harness.registry.state("remote").unwrap(), ServerState::Idle);
    assert_eq!(
        harness.browser.registered(),
        vec![harness.registry.settings().redirect_uri.clone()]
    );

    let opened = harness.browser.last_opened().unwrap();
    assert_eq!(opened.host_str(), Some("auth.example.com"));
    assert!(opened
        .query_pairs()
        .any(|(k, v)| k == "code_challenge_method" && v == "S256"));

    let stored = harness.registry.get("remote").unwrap();
    let tokens = stored.oauth().unwrap().tokens.clone().unwrap();
    assert_eq!(tokens.access_token, "access-1");
    assert!(harness
        .store
        .keys(FLOW_STATE_PREFIX)
        .await
        .unwrap()
        .is_empty());

    harness.registry.start_server("remote").await.unwrap();
    let connections = harness.http.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].bearer.as_deref(), Some("access-1"));
    harness.registry.dispose().await;
}

#[tokio::test]
async fn test_denied_authorization_requires_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("never"))
        .expect(0)
        .mount(&server)
        .await;

    let harness = TestHarness::with_parts(
        fast_settings(),
        memory_store(),
        RecordingBrowser::denying("access_denied"),
    );
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server("remote", &format!("{}/token", server.uri()), None))
        .await
        .unwrap();

    let err = harness.registry.authenticate("remote").await.unwrap_err();
    assert!(matches!(err, McpError::InvalidCallback(_)), "unexpected error {err:?}");
    assert_eq!(
        harness.registry.state("remote").unwrap(),
        ServerState::AuthRequired
    );
    assert!(harness
        .store
        .keys(FLOW_STATE_PREFIX)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_callback_for_unknown_flow_is_rejected() {
    let harness = TestHarness::new(fast_settings());
    harness.registry.initialize().await.unwrap();

    // Nothing is registered with the browser until a flow starts.
    assert!(harness.browser.registered().is_empty());

    let err = harness
        .registry
        .tokens()
        .handle_callback("http://127.0.0.1:19876/mcp/oauth/callback?code=x&state=forged")
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::InvalidState(_)));
}

#[tokio::test]
async fn test_discovery_registers_client_and_feeds_authorization() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resource": format!("{base}/mcp"),
            "authorization_servers": [base.clone()],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": base.clone(),
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/register"),
            "scopes_supported": ["mcp:read", "mcp:write"],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"client_id": "dyn-client"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("client_id=dyn-client"))
        .respond_with(token_response("access-dyn"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = TestHarness::with_parts(
        fast_settings(),
        memory_store(),
        RecordingBrowser::approving("code-1"),
    );
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(http_server("remote", &format!("{base}/mcp")))
        .await
        .unwrap();

    // Authorizing a server with no known endpoints discovers them first.
    harness.registry.authenticate("remote").await.unwrap();

    let config = harness.registry.get("remote").unwrap();
    let AuthConfig::OAuth(oauth) = &config.auth else {
        panic!("discovery should switch the server to OAuth");
    };
    assert_eq!(oauth.client_id.as_deref(), Some("dyn-client"));
    assert_eq!(oauth.token_endpoint.as_deref(), Some(format!("{base}/token").as_str()));
    assert_eq!(oauth.resource.as_deref(), Some(format!("{base}/mcp").as_str()));
    assert_eq!(oauth.scope.as_deref(), Some("mcp:read mcp:write"));
    assert_eq!(
        oauth.tokens.as_ref().map(|t| t.access_token.as_str()),
        Some("access-dyn")
    );

    let opened = harness.browser.last_opened().unwrap();
    assert_eq!(opened.path(), "/authorize");
    assert!(opened
        .query_pairs()
        .any(|(k, v)| k == "resource" && v == format!("{base}/mcp")));
    harness.registry.dispose().await;
}

#[tokio::test]
async fn test_unauthorized_handshake_requires_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(token_response("access-new"))
        .expect(1)
        .mount(&server)
        .await;

    let http_client = reqwest::Client::new();
    let registry = Registry::new(
        RegistryDeps {
            store: memory_store(),
            process: Arc::new(FakeProcessAdapter::new()),
            http: Arc::new(ReqwestHttpAdapter::with_client(http_client.clone())),
            browser: Arc::new(RecordingBrowser::approving("code-2")),
            http_client,
        },
        fast_settings(),
    );
    registry.initialize().await.unwrap();

    let auth = oauth_server(
        "remote",
        &format!("{}/token", server.uri()),
        Some(OAuthTokens::bearer("revoked")),
    )
    .auth;
    registry
        .add(ServerConfig::http("remote", format!("{}/mcp", server.uri())).with_auth(auth))
        .await
        .unwrap();

    let err = registry.start_server("remote").await.unwrap_err();
    assert!(matches!(err, McpError::AuthRequired(ref id) if id == "remote"), "unexpected error {err:?}");
    assert_eq!(registry.state("remote").unwrap(), ServerState::AuthRequired);
    assert_eq!(
        registry.metadata("remote").unwrap().error_code.as_deref(),
        Some("AUTH_REQUIRED")
    );

    registry.authenticate("remote").await.unwrap();
    assert_eq!(registry.state("remote").unwrap(), ServerState::Idle);
    let tokens = registry.get("remote").unwrap().oauth().unwrap().tokens.clone().unwrap();
    assert_eq!(tokens.access_token, "access-new");
    registry.dispose().await;
}

#[tokio::test]
async fn test_revoked_session_requires_auth() {
    let harness = TestHarness::new(fast_settings());
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            "https://auth.example.com/token",
            Some(OAuthTokens::bearer("access-1")),
        ))
        .await
        .unwrap();
    harness.registry.start_server("remote").await.unwrap();

    let transport = harness.http.last_handle().unwrap();
    transport.revoke();

    let err = harness.registry.refresh_capabilities("remote").await.unwrap_err();
    assert!(matches!(err, McpError::AuthRequired(_)), "unexpected error {err:?}");
    assert_eq!(
        harness.registry.state("remote").unwrap(),
        ServerState::AuthRequired
    );
    assert!(went(
        &harness.registry,
        "remote",
        ServerState::Running,
        ServerState::AuthRequired,
        StateEvent::AuthRequired
    ));
    assert_eq!(transport.terminate_count(), 1);
    assert!(harness.registry.capabilities("remote").unwrap().is_none());
    harness.registry.dispose().await;
}

#[tokio::test]
async fn test_health_check_rejected_credentials_require_auth() {
    let mut settings = fast_settings();
    settings.supervisor.health_checks = true;
    settings.supervisor.health_check_interval_ms = 20;

    let harness = TestHarness::new(settings);
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            "https://auth.example.com/token",
            Some(OAuthTokens::bearer("access-1")),
        ))
        .await
        .unwrap();
    harness.registry.start_server("remote").await.unwrap();

    let transport = harness.http.last_handle().unwrap();
    transport.revoke();

    let registry = &harness.registry;
    eventually("AUTH_REQUIRED", || {
        registry.state("remote").unwrap() == ServerState::AuthRequired
    })
    .await;
    eventually("transport shutdown", || transport.terminate_count() == 1).await;
    assert!(!registry.supervisor().record("remote").unwrap().running);
    registry.dispose().await;
}

#[tokio::test]
async fn test_authenticate_recovers_from_error_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("access-1"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = TestHarness::with_parts(
        fast_settings(),
        memory_store(),
        RecordingBrowser::approving("code-1"),
    );
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            &format!("{}/token", server.uri()),
            Some(OAuthTokens::bearer("access-0")),
        ))
        .await
        .unwrap();

    harness.http.fail_always(Some("unreachable"));
    harness.registry.start_server("remote").await.unwrap_err();
    assert_eq!(harness.registry.state("remote").unwrap(), ServerState::Error);

    harness.registry.authenticate("remote").await.unwrap();
    assert_eq!(harness.registry.state("remote").unwrap(), ServerState::Idle);
    assert!(went(
        &harness.registry,
        "remote",
        ServerState::Error,
        ServerState::Idle,
        StateEvent::Reset
    ));

    harness.http.fail_always(None);
    harness.registry.start_server("remote").await.unwrap();
    assert_eq!(
        harness.http.connections().last().unwrap().bearer.as_deref(),
        Some("access-1")
    );
    harness.registry.dispose().await;
}

#[tokio::test]
async fn test_unanswered_authorization_times_out() {
    let mut settings = fast_settings();
    settings.token.flow_timeout_ms = 100;

    let harness = TestHarness::new(settings);
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server("remote", "https://auth.example.com/token", None))
        .await
        .unwrap();

    let err = harness.registry.authenticate("remote").await.unwrap_err();
    assert!(matches!(err, McpError::FlowTimeout(ref id) if id == "remote"), "unexpected error {err:?}");
    assert_eq!(
        harness.registry.state("remote").unwrap(),
        ServerState::AuthRequired
    );
    assert!(harness
        .store
        .keys(FLOW_STATE_PREFIX)
        .await
        .unwrap()
        .is_empty());

    // A late redirect finds no pending flow.
    let opened = harness.browser.last_opened().unwrap();
    let state = opened
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let err = harness
        .registry
        .tokens()
        .handle_callback(&format!(
            "http://127.0.0.1:19876/mcp/oauth/callback?code=late&state={state}"
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::InvalidState(_)), "unexpected error {err:?}");
    harness.registry.dispose().await;
}

#[tokio::test]
async fn test_background_refresh_cycles_through_token_refreshing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(token_response("access-2"))
        .expect(1)
        .mount(&server)
        .await;

    let mut settings = fast_settings();
    settings.token.background_refresh = true;
    settings.token.refresh_buffer_ms = 60_000;

    let harness = TestHarness::new(settings);
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            &format!("{}/token", server.uri()),
            Some(refreshable("access-1", 60_300)),
        ))
        .await
        .unwrap();
    harness.registry.start_server("remote").await.unwrap();
    assert!(harness.registry.tokens().has_background_refresh("remote"));

    let registry = &harness.registry;
    eventually("TOKEN_REFRESHED", || {
        went(
            registry,
            "remote",
            ServerState::TokenRefreshing,
            ServerState::Running,
            StateEvent::TokenRefreshed,
        )
    })
    .await;
    assert!(went(
        registry,
        "remote",
        ServerState::Running,
        ServerState::TokenRefreshing,
        StateEvent::RefreshToken
    ));
    assert_eq!(registry.state("remote").unwrap(), ServerState::Running);
    assert_eq!(
        harness.http.last_handle().unwrap().bearer().as_deref(),
        Some("access-2")
    );
    // Re-armed against the new expiry.
    assert!(registry.tokens().has_background_refresh("remote"));
    let tokens = registry.get("remote").unwrap().oauth().unwrap().tokens.clone().unwrap();
    assert_eq!(tokens.access_token, "access-2");
    registry.dispose().await;
}

#[tokio::test]
async fn test_failed_refresh_of_valid_token_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut settings = fast_settings();
    settings.token.background_refresh = true;
    settings.token.refresh_buffer_ms = 60_000;
    settings.token.refresh_retry_ms = 50;

    let harness = TestHarness::new(settings);
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            &format!("{}/token", server.uri()),
            Some(refreshable("access-1", 60_200)),
        ))
        .await
        .unwrap();
    harness.registry.start_server("remote").await.unwrap();

    let mut attempts = 0;
    for _ in 0..300 {
        attempts = server.received_requests().await.unwrap_or_default().len();
        if attempts >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(attempts >= 2, "refresh was not retried");

    let registry = &harness.registry;
    eventually("rescheduled refresh", || {
        registry.state("remote").unwrap() == ServerState::Running
            && registry.tokens().has_background_refresh("remote")
    })
    .await;
    assert_eq!(
        harness.http.last_handle().unwrap().bearer().as_deref(),
        Some("access-1")
    );
    registry.dispose().await;
}

#[tokio::test]
async fn test_failed_refresh_of_expired_token_disconnects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    let mut settings = fast_settings();
    settings.token.refresh_buffer_ms = 0;

    let harness = TestHarness::new(settings);
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            &format!("{}/token", server.uri()),
            Some(refreshable("access-1", 150)),
        ))
        .await
        .unwrap();
    harness.registry.start_server("remote").await.unwrap();
    let transport = harness.http.last_handle().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let config = harness.registry.get("remote").unwrap();
    let err = harness.registry.tokens().refresh(&config).await.unwrap_err();
    assert!(matches!(err, McpError::RefreshFailed { .. }), "unexpected error {err:?}");

    let registry = &harness.registry;
    assert_eq!(registry.state("remote").unwrap(), ServerState::AuthRequired);
    assert!(went(
        registry,
        "remote",
        ServerState::TokenRefreshing,
        ServerState::AuthRequired,
        StateEvent::RefreshFailed
    ));
    assert_eq!(
        registry.metadata("remote").unwrap().error_code.as_deref(),
        Some("REFRESH_FAILED")
    );
    eventually("disconnect", || transport.terminate_count() == 1).await;
    registry.dispose().await;
}

#[tokio::test]
async fn test_dispose_flushes_refreshed_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("access-2"))
        .mount(&server)
        .await;

    let harness = TestHarness::new(fast_settings());
    harness.registry.initialize().await.unwrap();
    harness
        .registry
        .add(oauth_server(
            "remote",
            &format!("{}/token", server.uri()),
            Some(refreshable("access-1", 3_600_000)),
        ))
        .await
        .unwrap();

    let config = harness.registry.get("remote").unwrap();
    harness.registry.tokens().refresh(&config).await.unwrap();
    harness.registry.dispose().await;

    let reopened = harness.reopen(fast_settings());
    reopened.registry.load().await.unwrap();
    let tokens = reopened
        .registry
        .get("remote")
        .unwrap()
        .oauth()
        .unwrap()
        .tokens
        .clone()
        .unwrap();
    assert_eq!(tokens.access_token, "access-2");
    reopened.registry.dispose().await;
}
