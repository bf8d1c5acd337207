//! OAuth 2.1 primitives for remote MCP servers.
//!
//! PKCE generation, authorization URLs and the two token-endpoint grants.
//! Flow orchestration lives in [`crate::token`].

use crate::error::{McpError, McpResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use conduit_util::now_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// OAuth callback port for the loopback redirect.
pub const OAUTH_CALLBACK_PORT: u16 = 19876;

/// OAuth callback path for the loopback redirect.
pub const OAUTH_CALLBACK_PATH: &str = "/mcp/oauth/callback";

/// Storage key prefix for in-flight authorization state.
pub const FLOW_STATE_PREFIX: &str = "oauth_state_";

const VERIFIER_LEN: usize = 64;
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// The default loopback redirect URI.
pub fn default_redirect_uri() -> String {
    format!("http://127.0.0.1:{OAUTH_CALLBACK_PORT}{OAUTH_CALLBACK_PATH}")
}

/// Tokens held for one server. Expiry is absolute, in Unix milliseconds.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expires_at: None,
            scope: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at_ms: i64) -> Self {
        self.expires_at = Some(expires_at_ms);
        self
    }

    /// Whether the access token has expired at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Milliseconds until expiry, negative once expired.
    pub fn expires_in_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at.map(|exp| exp - now_ms)
    }
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, issued_at_ms: i64) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(default_token_type),
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| issued_at_ms + (secs as i64).saturating_mul(1000)),
            scope: self.scope,
        }
    }
}

/// State persisted for the duration of one authorization round-trip.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthFlowState {
    pub state: String,
    pub code_verifier: String,
    pub server_id: String,
    pub expires_at: i64,
    pub redirect_uri: String,
}

impl OAuthFlowState {
    /// Storage key for this flow.
    pub fn key(&self) -> String {
        flow_state_key(&self.state)
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

impl fmt::Debug for OAuthFlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthFlowState")
            .field("server_id", &self.server_id)
            .field("expires_at", &self.expires_at)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

/// Storage key for the flow identified by `state`.
pub fn flow_state_key(state: &str) -> String {
    format!("{FLOW_STATE_PREFIX}{state}")
}

/// A PKCE verifier and its S256 challenge.
#[derive(Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// 64 characters from the RFC 7636 unreserved set.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    (0..VERIFIER_LEN)
        .map(|_| UNRESERVED[rng.gen_range(0..UNRESERVED.len())] as char)
        .collect()
}

/// Base64URL(SHA-256(verifier)) without padding.
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Random CSRF state parameter.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 24] = rng.gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Query parameters of an authorization-code request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: Option<&'a str>,
    pub state: &'a str,
    pub code_challenge: &'a str,
    /// RFC 8707 resource indicator.
    pub resource: Option<&'a str>,
}

impl AuthorizationRequest<'_> {
    /// `auth_endpoint` with the request appended to any query it already has.
    pub fn url(&self, auth_endpoint: &str) -> McpResult<String> {
        let mut url = url::Url::parse(auth_endpoint).map_err(|e| {
            McpError::DiscoveryFailed(format!("Invalid authorization endpoint {auth_endpoint}: {e}"))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", self.client_id)
                .append_pair("redirect_uri", self.redirect_uri)
                .append_pair("state", self.state)
                .append_pair("code_challenge", self.code_challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(scope) = self.scope {
                query.append_pair("scope", scope);
            }
            if let Some(resource) = self.resource {
                query.append_pair("resource", resource);
            }
        }
        Ok(url.into())
    }
}

/// Client credentials presented to the token endpoint.
#[derive(Clone, Copy)]
pub struct ClientCredentials<'a> {
    pub client_id: &'a str,
    pub client_secret: Option<&'a str>,
}

/// POST one grant to the token endpoint. `fail` wraps every error so the
/// caller decides which variant a failed grant becomes.
async fn grant(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: ClientCredentials<'_>,
    mut form: Vec<(&'static str, &str)>,
    fail: impl Fn(String) -> McpError,
) -> McpResult<OAuthTokens> {
    let mut request = http
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json");
    request = match client.client_secret {
        Some(secret) => request.basic_auth(client.client_id, Some(secret)),
        None => {
            form.push(("client_id", client.client_id));
            request
        }
    };

    let issued_at = now_ms();
    let response = request
        .form(&form)
        .send()
        .await
        .map_err(|e| fail(format!("Cannot reach token endpoint: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(fail(format!("{status} from token endpoint: {}", body.trim())));
    }
    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| fail(format!("Unreadable token response: {e}")))?;
    Ok(body.into_tokens(issued_at))
}

/// Trade an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: ClientCredentials<'_>,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> McpResult<OAuthTokens> {
    debug!(endpoint = %token_endpoint, "Exchanging authorization code");
    grant(
        http,
        token_endpoint,
        client,
        vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ],
        McpError::CodeExchangeFailed,
    )
    .await
}

/// Redeem a refresh token.
///
/// Servers that do not rotate refresh tokens omit one from the response;
/// the old one stays in use.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    server_id: &str,
    token_endpoint: &str,
    client: ClientCredentials<'_>,
    refresh_token: &str,
) -> McpResult<OAuthTokens> {
    debug!(server = %server_id, endpoint = %token_endpoint, "Refreshing access token");
    let mut tokens = grant(
        http,
        token_endpoint,
        client,
        vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
        |message| McpError::RefreshFailed {
            server: server_id.to_string(),
            message,
        },
    )
    .await?;
    tokens
        .refresh_token
        .get_or_insert_with(|| refresh_token.to_string());
    Ok(tokens)
}
