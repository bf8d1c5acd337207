//! Streamable HTTP transport for remote MCP servers.
//!
//! Every message is a POST. Responses arrive either as plain JSON or as a
//! `text/event-stream` carrying the JSON-RPC response in a `data:` line.
//! The server may assign a session with the `mcp-session-id` header, which
//! is echoed on every later request.

use crate::error::{McpError, McpResult};
use crate::protocol::{self, Message, Request};
use crate::server::HttpTransport;
use crate::transport::{ExitStatus, HttpAdapter, TransportHandle};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Session header defined by the streamable HTTP transport.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Default timeout for a single HTTP request.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Connects with `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpAdapter {
    client: Client,
}

impl ReqwestHttpAdapter {
    pub fn new() -> McpResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| McpError::connection_failed(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpAdapter for ReqwestHttpAdapter {
    async fn connect(
        &self,
        server_id: &str,
        transport: &HttpTransport,
        bearer: Option<&str>,
    ) -> McpResult<Arc<dyn TransportHandle>> {
        url::Url::parse(&transport.url)
            .map_err(|e| McpError::invalid_config(format!("Invalid url '{}': {e}", transport.url)))?;

        let handle: Arc<dyn TransportHandle> = Arc::new(HttpHandle::new(
            server_id,
            self.client.clone(),
            transport,
            bearer.map(str::to_string),
        ));
        protocol::handshake(handle.as_ref()).await?;
        Ok(handle)
    }
}

/// One HTTP session.
pub struct HttpHandle {
    server_id: String,
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
    bearer: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl HttpHandle {
    pub fn new(
        server_id: &str,
        client: Client,
        transport: &HttpTransport,
        bearer: Option<String>,
    ) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut headers: Vec<(String, String)> = transport
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();

        Self {
            server_id: server_id.to_string(),
            client,
            url: transport.url.clone(),
            headers,
            bearer: RwLock::new(bearer),
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            exit_tx,
            exit_rx,
        }
    }

    /// Session assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn build_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = builder;
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        let bearer = self
            .bearer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(token) = bearer {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(session) = self.session_id() {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    async fn post(&self, message: &Request<'_>) -> McpResult<reqwest::Response> {
        if !self.is_alive() {
            return Err(McpError::ConnectionClosed(format!(
                "{} session closed",
                self.server_id
            )));
        }

        let body = serde_json::to_string(message)?;
        let response = self
            .build_request(self.client.post(&self.url))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().unwrap_or_else(|e| e.into_inner()) = Some(session.to_string());
        }

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(McpError::AuthRequired(self.server_id.clone())),
            status if !status.is_success() => {
                let text = response.text().await.unwrap_or_default();
                Err(McpError::protocol(format!("Server returned {status}: {text}")))
            }
            _ => Ok(response),
        }
    }

    fn send_error(&self, e: reqwest::Error) -> McpError {
        if e.is_timeout() {
            McpError::Timeout
        } else if e.is_connect() {
            // An established session whose endpoint vanished.
            if self.session_id().is_some() {
                self.exit_tx.send_replace(Some(ExitStatus::abnormal()));
            }
            McpError::connection_failed(format!("{}: {e}", self.url))
        } else {
            McpError::protocol(format!("Request failed: {e}"))
        }
    }
}

#[async_trait]
impl TransportHandle for HttpHandle {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn set_bearer(&self, token: &str) {
        *self.bearer.write().unwrap_or_else(|e| e.into_inner()) = Some(token.to_string());
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(server = %self.server_id, id, method, "Sending HTTP request");

        let response = self.post(&Request::call(id, method, params)).await?;
        parse_response(response).await?.into_result(method)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.post(&Request::notification(method, params))
            .await
            .map(|_| ())
    }

    async fn terminate(&self) -> McpResult<()> {
        if let Some(session) = self.session_id() {
            let result = self
                .build_request(self.client.delete(&self.url))
                .header(SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                warn!(server = %self.server_id, error = %e, "Failed to end HTTP session");
            }
        }
        self.exit_tx.send_replace(Some(ExitStatus::clean()));
        Ok(())
    }

    async fn kill(&self) -> McpResult<()> {
        self.exit_tx.send_replace(Some(ExitStatus::clean()));
        Ok(())
    }

    fn exit_receiver(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_rx.clone()
    }

    fn take_stderr(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        None
    }

    fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }
}

async fn parse_response(response: reqwest::Response) -> McpResult<Message> {
    let is_stream = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_stream {
        return parse_sse_stream(response).await;
    }

    let text = response
        .text()
        .await
        .map_err(|e| McpError::protocol(format!("Failed to read response: {e}")))?;
    serde_json::from_str(&text).map_err(|e| McpError::protocol(format!("Invalid JSON response: {e}")))
}

async fn parse_sse_stream(response: reqwest::Response) -> McpResult<Message> {
    use futures::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| McpError::protocol(format!("Stream error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            if let Some(response) = parse_sse_line(&line) {
                return Ok(response);
            }
        }
    }

    // A final event without a trailing newline.
    parse_sse_line(&buffer).ok_or_else(|| McpError::protocol("SSE stream ended without response"))
}

fn parse_sse_line(line: &str) -> Option<Message> {
    let data = line.trim_end().strip_prefix("data:")?.trim_start();
    serde_json::from_str::<Message>(data)
        .ok()
        .filter(|m| m.reply_to().is_some())
}
