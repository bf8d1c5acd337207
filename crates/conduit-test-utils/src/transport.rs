//! Fake transports and the adapters that hand them out.

use async_trait::async_trait;
use conduit_mcp::{
    ExitStatus, HttpAdapter, HttpTransport, McpError, McpResult, ProcessAdapter, StdioTransport,
    TransportHandle,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// A scripted MCP server.
///
/// Answers `tools/list`, `resources/list`, `prompts/list` and `ping` with
/// empty results unless told otherwise. `terminate` exits cleanly unless the
/// transport is [`stubborn`](FakeTransport::stubborn).
pub struct FakeTransport {
    server_id: String,
    responses: Mutex<HashMap<String, Result<Value, String>>>,
    requests: Mutex<Vec<(String, Option<Value>)>>,
    stubborn: bool,
    terminate_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    stderr_tx: mpsc::UnboundedSender<String>,
    stderr_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    bearer: Mutex<Option<String>>,
    revoked: AtomicBool,
}

impl FakeTransport {
    pub fn new(server_id: impl Into<String>) -> Self {
        let (exit_tx, _) = watch::channel(None);
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let responses = HashMap::from([
            ("tools/list".to_string(), Ok(json!({"tools": []}))),
            ("resources/list".to_string(), Ok(json!({"resources": []}))),
            ("prompts/list".to_string(), Ok(json!({"prompts": []}))),
            ("ping".to_string(), Ok(json!({}))),
        ]);
        Self {
            server_id: server_id.into(),
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            stubborn: false,
            terminate_calls: AtomicUsize::new(0),
            kill_calls: AtomicUsize::new(0),
            exit_tx,
            stderr_tx,
            stderr_rx: Mutex::new(Some(stderr_rx)),
            bearer: Mutex::new(None),
            revoked: AtomicBool::new(false),
        }
    }

    /// Ignore `terminate`; only `kill` ends the transport.
    pub fn stubborn(mut self) -> Self {
        self.stubborn = true;
        self
    }

    pub fn with_response(self, method: &str, result: Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), Ok(result));
        self
    }

    pub fn with_error(self, method: &str, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), Err(message.to_string()));
        self
    }

    /// Report an exit, as if the server process ended.
    pub fn exit(&self, code: Option<i32>) {
        self.exit_tx.send_replace(Some(ExitStatus { code }));
    }

    /// Reject every later request as unauthorized, as a server does once
    /// it stops accepting the bearer token.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn emit_stderr(&self, line: &str) {
        let _ = self.stderr_tx.send(line.to_string());
    }

    pub fn terminate_count(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    /// Methods requested so far, in order.
    pub fn requested_methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn bearer(&self) -> Option<String> {
        self.bearer.lock().unwrap().clone()
    }

    pub(crate) fn set_initial_bearer(&self, bearer: Option<&str>) {
        *self.bearer.lock().unwrap() = bearer.map(str::to_string);
    }
}

#[async_trait]
impl TransportHandle for FakeTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_alive() {
            return Err(McpError::ConnectionClosed(self.server_id.clone()));
        }
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        if self.revoked.load(Ordering::SeqCst) {
            return Err(McpError::AuthRequired(self.server_id.clone()));
        }
        match self.responses.lock().unwrap().get(method) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(McpError::protocol(message.clone())),
            None => Err(McpError::protocol(format!("Method not found: {method}"))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        Ok(())
    }

    async fn terminate(&self) -> McpResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn {
            self.exit(Some(0));
        }
        Ok(())
    }

    async fn kill(&self) -> McpResult<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.exit(None);
        Ok(())
    }

    fn exit_receiver(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_tx.subscribe()
    }

    fn take_stderr(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stderr_rx.lock().unwrap().take()
    }

    fn is_alive(&self) -> bool {
        self.exit_tx.borrow().is_none()
    }

    fn set_bearer(&self, token: &str) {
        *self.bearer.lock().unwrap() = Some(token.to_string());
    }
}

type Customize = Box<dyn Fn(FakeTransport) -> FakeTransport + Send + Sync>;

/// Shared bookkeeping for the fake adapters.
#[derive(Default)]
struct Connector {
    handles: Mutex<Vec<Arc<FakeTransport>>>,
    failures_left: AtomicUsize,
    fail_always: Mutex<Option<String>>,
    customize: Mutex<Option<Customize>>,
    delay: Mutex<Option<Duration>>,
}

impl Connector {
    async fn connect(&self, server_id: &str, bearer: Option<&str>) -> McpResult<Arc<FakeTransport>> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let always = self.fail_always.lock().unwrap().clone();
        if let Some(message) = always {
            return Err(McpError::SpawnFailed {
                server: server_id.to_string(),
                message,
            });
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(McpError::SpawnFailed {
                server: server_id.to_string(),
                message: "scripted failure".to_string(),
            });
        }

        let mut transport = FakeTransport::new(server_id);
        if let Some(customize) = self.customize.lock().unwrap().as_ref() {
            transport = customize(transport);
        }
        transport.set_initial_bearer(bearer);
        let transport = Arc::new(transport);
        self.handles.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

macro_rules! connector_controls {
    () => {
        /// Fail the next `n` connections.
        pub fn fail_next(&self, n: usize) {
            self.connector.failures_left.store(n, Ordering::SeqCst);
        }

        /// Fail every connection with `message` until cleared with `None`.
        pub fn fail_always(&self, message: Option<&str>) {
            *self.connector.fail_always.lock().unwrap() = message.map(str::to_string);
        }

        /// Adjust every transport handed out from now on.
        pub fn customize(&self, f: impl Fn(FakeTransport) -> FakeTransport + Send + Sync + 'static) {
            *self.connector.customize.lock().unwrap() = Some(Box::new(f));
        }

        /// Wait this long before answering each connection.
        pub fn delay(&self, delay: Duration) {
            *self.connector.delay.lock().unwrap() = Some(delay);
        }

        pub fn handles(&self) -> Vec<Arc<FakeTransport>> {
            self.connector.handles.lock().unwrap().clone()
        }

        pub fn last_handle(&self) -> Option<Arc<FakeTransport>> {
            self.connector.handles.lock().unwrap().last().cloned()
        }
    };
}

/// Hands out [`FakeTransport`]s for stdio servers.
#[derive(Default)]
pub struct FakeProcessAdapter {
    connector: Connector,
    spawned: Mutex<Vec<(String, StdioTransport)>>,
}

impl FakeProcessAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    connector_controls!();

    /// Every spawn request, including failed ones.
    pub fn spawned(&self) -> Vec<(String, StdioTransport)> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessAdapter for FakeProcessAdapter {
    async fn spawn(
        &self,
        server_id: &str,
        transport: &StdioTransport,
    ) -> McpResult<Arc<dyn TransportHandle>> {
        self.spawned
            .lock()
            .unwrap()
            .push((server_id.to_string(), transport.clone()));
        let handle: Arc<dyn TransportHandle> = self.connector.connect(server_id, None).await?;
        Ok(handle)
    }
}

/// A recorded HTTP connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub server_id: String,
    pub url: String,
    pub bearer: Option<String>,
}

/// Hands out [`FakeTransport`]s for HTTP servers.
#[derive(Default)]
pub struct FakeHttpAdapter {
    connector: Connector,
    connections: Mutex<Vec<Connection>>,
}

impl FakeHttpAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    connector_controls!();

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpAdapter for FakeHttpAdapter {
    async fn connect(
        &self,
        server_id: &str,
        transport: &HttpTransport,
        bearer: Option<&str>,
    ) -> McpResult<Arc<dyn TransportHandle>> {
        self.connections.lock().unwrap().push(Connection {
            server_id: server_id.to_string(),
            url: transport.url.clone(),
            bearer: bearer.map(str::to_string),
        });
        let handle: Arc<dyn TransportHandle> = self.connector.connect(server_id, bearer).await?;
        Ok(handle)
    }
}
