//! A browser that records what it was asked to open.

use async_trait::async_trait;
use conduit_mcp::{BrowserAdapter, CallbackHandler, McpError, McpResult, ProtocolHandlerGuard};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Reply {
    Approve { code: String },
    Deny { error: String },
}

/// Records opened URLs and registered redirect handlers.
///
/// By default nothing answers the authorization request; tests call
/// [`deliver`](RecordingBrowser::deliver) themselves. An
/// [`approving`](RecordingBrowser::approving) browser redirects back with a
/// code as soon as the authorization URL is opened.
#[derive(Default)]
pub struct RecordingBrowser {
    opened: Mutex<Vec<String>>,
    handlers: Arc<Mutex<Vec<(String, CallbackHandler)>>>,
    reply: Option<Reply>,
}

impl RecordingBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every authorization request with `code`.
    pub fn approving(code: &str) -> Self {
        Self {
            reply: Some(Reply::Approve {
                code: code.to_string(),
            }),
            ..Self::default()
        }
    }

    /// Answer every authorization request with an `error` redirect.
    pub fn denying(error: &str) -> Self {
        Self {
            reply: Some(Reply::Deny {
                error: error.to_string(),
            }),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn last_opened(&self) -> Option<url::Url> {
        self.opened
            .lock()
            .unwrap()
            .last()
            .and_then(|u| url::Url::parse(u).ok())
    }

    /// Redirect URIs handlers were registered for.
    pub fn registered(&self) -> Vec<String> {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Hand `callback_url` to the first registered handler.
    pub async fn deliver(&self, callback_url: &str) -> McpResult<()> {
        deliver(&self.handlers, callback_url).await
    }
}

async fn deliver(handlers: &Mutex<Vec<(String, CallbackHandler)>>, callback_url: &str) -> McpResult<()> {
    let handler = handlers.lock().unwrap().first().map(|(_, h)| h.clone());
    match handler {
        Some(handler) => handler(callback_url.to_string()).await,
        None => Err(McpError::InvalidCallback("no handler registered".to_string())),
    }
}

fn query_param(url: &url::Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

#[async_trait]
impl BrowserAdapter for RecordingBrowser {
    async fn open(&self, url: &str) -> McpResult<()> {
        self.opened.lock().unwrap().push(url.to_string());

        let Some(reply) = self.reply.clone() else {
            return Ok(());
        };
        let parsed = url::Url::parse(url)
            .map_err(|e| McpError::InvalidCallback(format!("unparseable authorization url: {e}")))?;
        let state = query_param(&parsed, "state").unwrap_or_default();
        let redirect = query_param(&parsed, "redirect_uri").unwrap_or_default();

        let callback = match reply {
            Reply::Approve { code } => format!("{redirect}?code={code}&state={state}"),
            Reply::Deny { error } => format!("{redirect}?error={error}&state={state}"),
        };
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            let _ = deliver(&handlers, &callback).await;
        });
        Ok(())
    }

    async fn register_protocol_handler(
        &self,
        redirect_uri: &str,
        handler: CallbackHandler,
    ) -> McpResult<ProtocolHandlerGuard> {
        self.handlers
            .lock()
            .unwrap()
            .push((redirect_uri.to_string(), handler));
        Ok(ProtocolHandlerGuard::noop())
    }
}
