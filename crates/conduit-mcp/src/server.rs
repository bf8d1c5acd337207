//! Server configuration records.
//!
//! A [`ServerConfig`] is the durable, user-authored description of one MCP
//! server. The registry persists the whole set as a JSON array.

use crate::oauth::OAuthTokens;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique, stable identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Whether the server starts automatically.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How to reach the server.
    pub transport: TransportConfig,

    /// Credentials presented to the server.
    #[serde(default, skip_serializing_if = "AuthConfig::is_none")]
    pub auth: AuthConfig,

    #[serde(default)]
    pub category: ServerCategory,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Startup timeout in milliseconds, overriding the manager default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio(
        id: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            transport: TransportConfig::Stdio(StdioTransport {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            }),
            auth: AuthConfig::None,
            category: ServerCategory::Other,
            description: None,
            timeout_ms: None,
        }
    }

    /// Create an HTTP server configuration.
    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            transport: TransportConfig::Http(HttpTransport {
                url: url.into(),
                headers: HashMap::new(),
            }),
            auth: AuthConfig::None,
            category: ServerCategory::Other,
            description: None,
            timeout_ms: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an environment variable (stdio only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio(stdio) = &mut self.transport {
            stdio.env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a header (HTTP only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Http(http) = &mut self.transport {
            http.headers.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_category(mut self, category: ServerCategory) -> Self {
        self.category = category;
        self
    }

    /// Disable the server.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The OAuth block, if this server uses OAuth.
    pub fn oauth(&self) -> Option<&OAuthConfig> {
        match &self.auth {
            AuthConfig::OAuth(oauth) => Some(oauth),
            _ => None,
        }
    }

    /// Server URL for HTTP transports.
    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Http(http) => Some(&http.url),
            TransportConfig::Stdio(_) => None,
        }
    }
}

/// Transport description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local child process speaking line-delimited JSON-RPC on stdio.
    Stdio(StdioTransport),
    /// Remote streamable-HTTP endpoint.
    Http(HttpTransport),
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio(_) => "stdio",
            TransportConfig::Http(_) => "http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioTransport {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTransport {
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Credentials for a server.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    /// A static bearer token.
    Token { token: String },
    /// OAuth 2.1 with PKCE; tokens are filled in after authorization.
    OAuth(OAuthConfig),
}

impl AuthConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, AuthConfig::None)
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Token { .. } => f.write_str("Token { .. }"),
            AuthConfig::OAuth(oauth) => f.debug_tuple("OAuth").field(oauth).finish(),
        }
    }
}

/// OAuth client configuration, plus the tokens obtained with it.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_access_token: Option<String>,
    /// Resource indicator sent with authorization requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Overrides the orchestrator-wide redirect URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("has_client_secret", &self.client_secret.is_some())
            .field("scope", &self.scope)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("resource", &self.resource)
            .field("redirect_uri", &self.redirect_uri)
            .field("tokens", &self.tokens)
            .finish()
    }
}

/// Coarse grouping used by UIs, inferred on import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerCategory {
    Database,
    Filesystem,
    Development,
    Communication,
    Productivity,
    Ai,
    Api,
    #[default]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stdio_config() {
        let config = ServerConfig::stdio("fs", "npx", ["-y", "@modelcontextprotocol/server-filesystem"])
            .with_env("ROOT", "/tmp");
        assert_eq!(config.name, "fs");
        match &config.transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command, "npx");
                assert_eq!(stdio.args.len(), 2);
                assert_eq!(stdio.env.get("ROOT").map(String::as_str), Some("/tmp"));
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn test_http_config_serializes_tagged() {
        let config = ServerConfig::http("gh", "https://mcp.example.com")
            .with_header("X-Team", "core")
            .with_auth(AuthConfig::Token {
                token: "secret".to_string(),
            });
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["transport"]["type"], "http");
        assert_eq!(value["transport"]["headers"]["X-Team"], "core");
        assert_eq!(value["auth"]["type"], "token");
        assert_eq!(value["category"], "other");

        let back: ServerConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_minimal_record_gets_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({
            "id": "fs",
            "name": "Filesystem",
            "transport": {"type": "stdio", "command": "mcp-fs"}
        }))
        .unwrap();
        assert!(config.enabled);
        assert!(config.auth.is_none());
        assert_eq!(config.category, ServerCategory::Other);
    }

    #[test]
    fn test_static_token_is_not_debug_printed() {
        let auth = AuthConfig::Token {
            token: "ghp_secret".to_string(),
        };
        assert!(!format!("{auth:?}").contains("ghp_secret"));
    }

    #[test]
    fn test_oauth_debug_hides_secret() {
        let oauth = OAuthConfig {
            client_id: Some("client".to_string()),
            client_secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let debug = format!("{oauth:?}");
        assert!(debug.contains("client"));
        assert!(!debug.contains("hunter2"));
    }
}
