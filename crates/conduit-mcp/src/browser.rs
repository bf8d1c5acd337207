//! Browser seam for interactive authorization.
//!
//! The token manager opens the authorization URL through a
//! [`BrowserAdapter`] and receives the redirect through the handler it
//! registered for the redirect URI.

use crate::callback::CallbackServer;
use crate::error::{McpError, McpResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives the full redirect URL the browser was sent to.
pub type CallbackHandler = Arc<dyn Fn(String) -> BoxFuture<'static, McpResult<()>> + Send + Sync>;

/// Keeps a redirect handler registered. Dropping it unregisters.
#[must_use = "dropping the guard unregisters the handler"]
pub struct ProtocolHandlerGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ProtocolHandlerGuard {
    pub fn from_fn(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Keep `resource` alive until the guard drops.
    pub fn holding(resource: impl Send + 'static) -> Self {
        Self::from_fn(move || drop(resource))
    }

    pub fn noop() -> Self {
        Self { cancel: None }
    }
}

impl Drop for ProtocolHandlerGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ProtocolHandlerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandlerGuard")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    /// Show `url` to the user.
    async fn open(&self, url: &str) -> McpResult<()>;

    /// Route redirects to `redirect_uri` into `handler`.
    async fn register_protocol_handler(
        &self,
        redirect_uri: &str,
        handler: CallbackHandler,
    ) -> McpResult<ProtocolHandlerGuard>;
}

/// The desktop browser, with a loopback server receiving `http` redirects.
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser;

impl SystemBrowser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserAdapter for SystemBrowser {
    async fn open(&self, url: &str) -> McpResult<()> {
        let target = url.to_string();
        let opened = tokio::task::spawn_blocking(move || open::that(&target))
            .await
            .map_err(|e| McpError::connection_failed(format!("Browser task failed: {e}")))?;

        match opened {
            Ok(()) => {
                debug!("Opened authorization URL in browser");
                Ok(())
            }
            Err(e) => {
                // Headless machines: the user can still copy the link.
                info!(error = %e, "Could not open a browser, visit this URL to authorize:\n{url}");
                Ok(())
            }
        }
    }

    async fn register_protocol_handler(
        &self,
        redirect_uri: &str,
        handler: CallbackHandler,
    ) -> McpResult<ProtocolHandlerGuard> {
        let parsed = url::Url::parse(redirect_uri)
            .map_err(|e| McpError::invalid_config(format!("Invalid redirect URI: {e}")))?;

        match parsed.scheme() {
            "http" => {
                let server = CallbackServer::bind(&parsed, handler).await?;
                Ok(ProtocolHandlerGuard::holding(server))
            }
            scheme => Err(McpError::invalid_config(format!(
                "Redirect scheme '{scheme}' needs an OS protocol handler; use an http loopback redirect"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_guard_runs_cancel_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let guard = ProtocolHandlerGuard::from_fn(move || flag.store(true, Ordering::SeqCst));
        assert!(!cancelled.load(Ordering::SeqCst));
        drop(guard);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_custom_scheme_is_rejected() {
        let handler: CallbackHandler = Arc::new(|_: String| async { Ok::<(), McpError>(()) }.boxed());
        let err = SystemBrowser::new()
            .register_protocol_handler("conduit://oauth/callback", handler)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig(_)));
    }
}
