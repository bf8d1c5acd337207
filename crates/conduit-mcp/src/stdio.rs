//! Child-process transport.
//!
//! Newline-delimited JSON-RPC over the child's stdin/stdout. A waiter task
//! owns the [`Child`] and is the only place that signals or reaps it; the
//! handle talks to it over a channel.

use crate::error::{McpError, McpResult};
use crate::protocol::{self, Message, Request};
use crate::server::StdioTransport;
use crate::transport::{ExitStatus, ProcessAdapter, TransportHandle};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Default timeout for a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

/// Spawns servers with `tokio::process`.
#[derive(Debug, Clone)]
pub struct TokioProcessAdapter {
    request_timeout: Duration,
}

impl TokioProcessAdapter {
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for TokioProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessAdapter for TokioProcessAdapter {
    async fn spawn(
        &self,
        server_id: &str,
        transport: &StdioTransport,
    ) -> McpResult<Arc<dyn TransportHandle>> {
        let handle: Arc<dyn TransportHandle> =
            Arc::new(StdioHandle::spawn(server_id, transport, self.request_timeout)?);

        if let Err(e) = protocol::handshake(handle.as_ref()).await {
            // Whatever the process did, it is not a usable server.
            let _ = handle.kill().await;
            return Err(e);
        }
        Ok(handle)
    }
}

enum Control {
    Terminate,
    Kill(oneshot::Sender<std::io::Result<()>>),
}

enum Step {
    Exited(std::io::Result<std::process::ExitStatus>),
    Control(Option<Control>),
}

/// A running child process.
pub struct StdioHandle {
    server_id: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    control: mpsc::UnboundedSender<Control>,
    exit: watch::Receiver<Option<ExitStatus>>,
    stderr: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    request_timeout: Duration,
}

impl StdioHandle {
    /// Start the process. Does not perform the MCP handshake.
    pub fn spawn(
        server_id: &str,
        transport: &StdioTransport,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let mut cmd = Command::new(&transport.command);
        cmd.args(&transport.args)
            .envs(&transport.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &transport.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                McpError::CommandNotFound {
                    server: server_id.to_string(),
                    command: transport.command.clone(),
                }
            } else {
                McpError::SpawnFailed {
                    server: server_id.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let missing = |pipe: &str| McpError::SpawnFailed {
            server: server_id.to_string(),
            message: format!("Failed to get {pipe} handle"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        debug!(
            server = %server_id,
            command = %transport.command,
            pid = ?child.id(),
            "Spawned MCP server process"
        );

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(read_stdout(server_id.to_string(), stdout, pending.clone()));

        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            // Keep draining even when nobody listens, so the child never blocks.
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_tx.send(line);
            }
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_child(server_id.to_string(), child, control_rx, exit_tx));

        Ok(Self {
            server_id: server_id.to_string(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            control: control_tx,
            exit: exit_rx,
            stderr: Mutex::new(Some(stderr_rx)),
            request_timeout,
        })
    }

    async fn write_line(&self, message: &Request<'_>) -> McpResult<()> {
        let json = serde_json::to_string(message)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::ConnectionClosed(format!("{} stdin closed", self.server_id)))?;

        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn closed(&self) -> McpError {
        McpError::ConnectionClosed(format!("{} exited", self.server_id))
    }
}

#[async_trait]
impl TransportHandle for StdioHandle {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.is_alive() {
            return Err(self.closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = Request::call(id, method, params);
        trace!(server = %self.server_id, id, method, "Sending request");
        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(method),
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => {
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.write_line(&Request::notification(method, params))
            .await
    }

    async fn terminate(&self) -> McpResult<()> {
        // Closing stdin is the MCP shutdown signal for stdio servers.
        drop(self.stdin.lock().await.take());
        if self.control.send(Control::Terminate).is_err() {
            trace!(server = %self.server_id, "Process already reaped");
        }
        Ok(())
    }

    async fn kill(&self) -> McpResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Kill(tx)).is_err() {
            return Ok(());
        }
        match rx.await {
            Ok(Ok(())) | Err(_) => Ok(()),
            Ok(Err(e)) => Err(McpError::KillFailed {
                server: self.server_id.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn exit_receiver(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit.clone()
    }

    fn take_stderr(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stderr.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

async fn read_stdout(server_id: String, stdout: ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server_id, error = %e, "Failed to read from server stdout");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<Message>(line) {
            Ok(message) => message,
            Err(_) => {
                trace!(server = %server_id, line, "Ignoring non-JSON output");
                continue;
            }
        };
        // Server-initiated requests and notifications are not handled here.
        let Some(id) = message.reply_to() else {
            trace!(server = %server_id, line, "Ignoring server message");
            continue;
        };
        let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!(server = %server_id, id, "Unmatched response"),
        }
    }

    // Fail everything still waiting.
    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

async fn wait_child(
    server_id: String,
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Control>,
    exit: watch::Sender<Option<ExitStatus>>,
) {
    let status = loop {
        let step = tokio::select! {
            status = child.wait() => Step::Exited(status),
            message = control.recv() => Step::Control(message),
        };

        match step {
            Step::Exited(status) => break status,
            Step::Control(Some(Control::Terminate)) => send_terminate(&server_id, &child),
            Step::Control(Some(Control::Kill(reply))) => {
                let _ = reply.send(child.start_kill());
            }
            Step::Control(None) => {
                // Handle dropped.
                let _ = child.start_kill();
                break child.wait().await;
            }
        }
    };

    let status = match status {
        Ok(status) => ExitStatus {
            code: status.code(),
        },
        Err(e) => {
            warn!(server = %server_id, error = %e, "Failed to wait for server process");
            ExitStatus::abnormal()
        }
    };
    debug!(server = %server_id, code = ?status.code, "Server process exited");
    exit.send_replace(Some(status));
}

#[cfg(unix)]
fn send_terminate(server_id: &str, child: &Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            warn!(server = %server_id, error = %e, "Failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_server_id: &str, _child: &Child) {
    // Closed stdin is the only graceful signal available.
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::wait_for_exit;

    fn sh(script: &str) -> StdioTransport {
        StdioTransport {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_missing_command_is_command_not_found() {
        let transport = StdioTransport {
            command: "conduit-definitely-not-a-command".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        };
        let err = StdioHandle::spawn("ghost", &transport, DEFAULT_REQUEST_TIMEOUT)
            .err()
            .unwrap();
        assert!(matches!(err, McpError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let handle = StdioHandle::spawn("exit", &sh("exit 3"), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let status = wait_for_exit(handle.exit_receiver()).await;
        assert_eq!(status, ExitStatus::exited(3));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_request_response_over_lines() {
        let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; read rest"#;
        let handle = StdioHandle::spawn("echo", &sh(script), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let result = handle.request("ping", None).await.unwrap();
        assert_eq!(result["ok"], true);

        handle.terminate().await.unwrap();
        let status = wait_for_exit(handle.exit_receiver()).await;
        assert!(!status.is_crash());
    }

    #[tokio::test]
    async fn test_kill_ends_process() {
        let handle = StdioHandle::spawn("sleep", &sh("sleep 30"), DEFAULT_REQUEST_TIMEOUT).unwrap();
        handle.kill().await.unwrap();
        let status = wait_for_exit(handle.exit_receiver()).await;
        assert_eq!(status.code, None);
    }

    #[tokio::test]
    async fn test_stderr_lines_are_forwarded() {
        let handle =
            StdioHandle::spawn("loud", &sh("echo oops >&2"), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let mut stderr = handle.take_stderr().unwrap();
        assert_eq!(stderr.recv().await.as_deref(), Some("oops"));
        assert!(handle.take_stderr().is_none());
    }
}
