//! MCP orchestration error types.

use crate::state::{ServerState, StateEvent};
use conduit_storage::StorageError;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur while configuring, running or authenticating servers.
#[derive(Debug, Error)]
pub enum McpError {
    // Configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Server '{name}' has neither a command nor a url")]
    MissingTransport { name: String },

    #[error("Server configuration is missing an id")]
    MissingId,

    #[error("Server already exists: {0}")]
    DuplicateServer(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    // Process
    #[error("Failed to start server '{server}': {message}")]
    SpawnFailed { server: String, message: String },

    #[error("Command not found for server '{server}': {command}")]
    CommandNotFound { server: String, command: String },

    #[error("Server '{server}' exited unexpectedly (code {code:?})")]
    ProcessCrashed { server: String, code: Option<i32> },

    #[error("Server '{server}' did not respond in time")]
    ProcessTimeout { server: String },

    #[error("Failed to kill server '{server}': {message}")]
    KillFailed { server: String, message: String },

    // Authentication
    #[error("Authentication required for server '{0}'")]
    AuthRequired(String),

    #[error("Access token expired for server '{0}'")]
    TokenExpired(String),

    #[error("Token refresh failed for server '{server}': {message}")]
    RefreshFailed { server: String, message: String },

    #[error("OAuth discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Invalid OAuth callback: {0}")]
    InvalidCallback(String),

    #[error("Unknown or expired OAuth state: {0}")]
    InvalidState(String),

    #[error("Authorization code exchange failed: {0}")]
    CodeExchangeFailed(String),

    #[error("Authorization for server '{0}' timed out")]
    FlowTimeout(String),

    #[error("Dynamic client registration failed: {0}")]
    RegistrationFailed(String),

    // Communication
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Request timed out")]
    Timeout,

    // State machine
    #[error("Server '{server}' cannot handle {event} while {from}")]
    InvalidTransition {
        server: String,
        from: ServerState,
        event: StateEvent,
    },

    #[error("Transition {event} for server '{server}' was vetoed")]
    TransitionVetoed { server: String, event: StateEvent },

    // Wrapped
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Stable machine-readable code, recorded in state metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::MissingTransport { .. } => "MISSING_TRANSPORT",
            Self::MissingId => "MISSING_ID",
            Self::DuplicateServer(_) => "DUPLICATE_SERVER",
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::CommandNotFound { .. } => "COMMAND_NOT_FOUND",
            Self::ProcessCrashed { .. } => "PROCESS_CRASHED",
            Self::ProcessTimeout { .. } => "PROCESS_TIMEOUT",
            Self::KillFailed { .. } => "KILL_FAILED",
            Self::AuthRequired(_) => "AUTH_REQUIRED",
            Self::TokenExpired(_) => "TOKEN_EXPIRED",
            Self::RefreshFailed { .. } => "REFRESH_FAILED",
            Self::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            Self::InvalidCallback(_) => "INVALID_CALLBACK",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::CodeExchangeFailed(_) => "CODE_EXCHANGE_FAILED",
            Self::FlowTimeout(_) => "FLOW_TIMEOUT",
            Self::RegistrationFailed(_) => "REGISTRATION_FAILED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::TransitionVetoed { .. } => "TRANSITION_VETOED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Http(_) => "HTTP_ERROR",
        }
    }

    /// The server this error concerns, when known.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateServer(id)
            | Self::ServerNotFound(id)
            | Self::AuthRequired(id)
            | Self::TokenExpired(id)
            | Self::FlowTimeout(id) => Some(id),
            Self::SpawnFailed { server, .. }
            | Self::CommandNotFound { server, .. }
            | Self::ProcessCrashed { server, .. }
            | Self::ProcessTimeout { server }
            | Self::KillFailed { server, .. }
            | Self::RefreshFailed { server, .. }
            | Self::InvalidTransition { server, .. }
            | Self::TransitionVetoed { server, .. } => Some(server),
            _ => None,
        }
    }

    /// Whether the user has to (re-)authorize before the server can start.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired(_) | Self::TokenExpired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                McpError::ServerNotFound("github".to_string()),
                "Server not found: github",
            ),
            (
                McpError::MissingTransport {
                    name: "broken".to_string(),
                },
                "Server 'broken' has neither a command nor a url",
            ),
            (
                McpError::ProcessCrashed {
                    server: "fs".to_string(),
                    code: Some(1),
                },
                "Server 'fs' exited unexpectedly (code Some(1))",
            ),
            (
                McpError::InvalidTransition {
                    server: "fs".to_string(),
                    from: ServerState::Idle,
                    event: StateEvent::Stopped,
                },
                "Server 'fs' cannot handle STOPPED while IDLE",
            ),
            (McpError::Timeout, "Request timed out"),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_codes_and_server_ids() {
        let err = McpError::CommandNotFound {
            server: "fs".to_string(),
            command: "nope".to_string(),
        };
        assert_eq!(err.code(), "COMMAND_NOT_FOUND");
        assert_eq!(err.server_id(), Some("fs"));

        let err = McpError::invalid_config("bad");
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert_eq!(err.server_id(), None);

        assert!(McpError::AuthRequired("gh".to_string()).is_auth_required());
        assert!(McpError::TokenExpired("gh".to_string()).is_auth_required());
        assert!(!McpError::Timeout.is_auth_required());
    }

    #[test]
    fn test_error_from_storage_keeps_source() {
        let storage_err = StorageError::invalid_key("bad/key");
        let err: McpError = storage_err.into();
        assert_eq!(err.code(), "STORAGE_ERROR");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: McpError = json_err.into();
        assert!(err.to_string().contains("JSON error"));
    }
}
