//! Transport seams.
//!
//! The manager never touches processes or sockets directly. It asks a
//! [`ProcessAdapter`] or [`HttpAdapter`] for a [`TransportHandle`] and drives
//! that handle.

use crate::error::McpResult;
use crate::server::{HttpTransport, StdioTransport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// How a transport ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Process exit code. `None` when the process was ended by a signal or
    /// the connection was closed on purpose.
    pub code: Option<i32>,
}

impl ExitStatus {
    /// Code reported when a connection ends without us asking it to.
    pub const ABNORMAL_CODE: i32 = -1;

    pub fn exited(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Clean exit, or an exit we caused.
    pub fn clean() -> Self {
        Self { code: None }
    }

    pub fn abnormal() -> Self {
        Self::exited(Self::ABNORMAL_CODE)
    }

    /// A non-zero exit code counts as a crash.
    pub fn is_crash(&self) -> bool {
        matches!(self.code, Some(code) if code != 0)
    }
}

/// A live connection to one server.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn server_id(&self) -> &str;

    /// Send a request and return its `result`.
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value>;

    /// Send a notification.
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Ask the server to shut down. Returns once the request was delivered,
    /// not when the server has exited.
    async fn terminate(&self) -> McpResult<()>;

    /// End the server immediately.
    async fn kill(&self) -> McpResult<()>;

    /// Becomes `Some` once the transport has ended.
    fn exit_receiver(&self) -> watch::Receiver<Option<ExitStatus>>;

    /// Stderr lines. Only the first caller receives them.
    fn take_stderr(&self) -> Option<mpsc::UnboundedReceiver<String>>;

    fn is_alive(&self) -> bool;

    /// Present a new access token on later requests. Transports that read
    /// the token once at startup ignore this.
    fn set_bearer(&self, _token: &str) {}
}

/// Spawns stdio servers.
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    /// Start the process and complete the MCP handshake.
    async fn spawn(
        &self,
        server_id: &str,
        transport: &StdioTransport,
    ) -> McpResult<Arc<dyn TransportHandle>>;
}

/// Connects to remote servers.
#[async_trait]
pub trait HttpAdapter: Send + Sync {
    /// Open a session and complete the MCP handshake.
    async fn connect(
        &self,
        server_id: &str,
        transport: &HttpTransport,
        bearer: Option<&str>,
    ) -> McpResult<Arc<dyn TransportHandle>>;
}

/// Wait until the transport reports an exit.
///
/// A sender dropped without reporting counts as an abnormal exit.
pub async fn wait_for_exit(mut rx: watch::Receiver<Option<ExitStatus>>) -> ExitStatus {
    loop {
        if let Some(status) = *rx.borrow_and_update() {
            return status;
        }
        if rx.changed().await.is_err() {
            let last = *rx.borrow();
            return last.unwrap_or_else(ExitStatus::abnormal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_classification() {
        assert!(ExitStatus::exited(1).is_crash());
        assert!(ExitStatus::abnormal().is_crash());
        assert!(!ExitStatus::exited(0).is_crash());
        assert!(!ExitStatus::clean().is_crash());
    }

    #[tokio::test]
    async fn test_wait_for_exit_sees_later_status() {
        let (tx, rx) = watch::channel(None);
        let waiter = tokio::spawn(wait_for_exit(rx));
        tx.send(Some(ExitStatus::exited(3))).unwrap();
        assert_eq!(waiter.await.unwrap(), ExitStatus::exited(3));
    }

    #[tokio::test]
    async fn test_wait_for_exit_dropped_sender_is_abnormal() {
        let (tx, rx) = watch::channel(None);
        drop(tx);
        assert_eq!(wait_for_exit(rx).await, ExitStatus::abnormal());
    }

    #[tokio::test]
    async fn test_wait_for_exit_already_exited() {
        let (_tx, rx) = watch::channel(Some(ExitStatus::clean()));
        assert_eq!(wait_for_exit(rx).await, ExitStatus::clean());
    }
}
