//! Loopback HTTP server receiving OAuth redirects.
//!
//! Serves `GET` on exactly one path, the one in the redirect URI. Only the
//! request line matters; headers are skipped.

use crate::browser::CallbackHandler;
use crate::error::{McpError, McpResult};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request line plus headers. Authorization codes and states are short.
const MAX_REQUEST_HEAD: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok => "200 OK",
            Status::BadRequest => "400 Bad Request",
            Status::NotFound => "404 Not Found",
            Status::MethodNotAllowed => "405 Method Not Allowed",
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// The page shown in the browser tab after the redirect.
fn page(authorized: bool, detail: &str) -> String {
    let (title, accent, close) = if authorized {
        ("Conduit is authorized", "#3fb950", "<script>setTimeout(() => window.close(), 1500)</script>")
    } else {
        ("Conduit was not authorized", "#f85149", "")
    };
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body style=\"font-family: system-ui, sans-serif; background: #0d1117; color: #c9d1d9; \
         display: grid; place-items: center; height: 100vh; margin: 0\">\n\
         <main style=\"text-align: center\"><h1 style=\"color: {accent}\">{title}</h1>\
         <p>{}</p></main>{close}</body></html>\n",
        escape(detail)
    )
}

/// Accepts redirects on the host, port and path of a redirect URI.
///
/// Stops listening when dropped.
pub struct CallbackServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl CallbackServer {
    /// Bind to the authority of `redirect_uri` and serve its path.
    pub async fn bind(redirect_uri: &url::Url, handler: CallbackHandler) -> McpResult<Self> {
        let host = redirect_uri.host_str().unwrap_or("127.0.0.1");
        let port = redirect_uri.port_or_known_default().unwrap_or(80);
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            McpError::connection_failed(format!(
                "Cannot listen for the OAuth redirect on {host}:{port}: {e}"
            ))
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listening for OAuth redirects");

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let path = redirect_uri.path().to_string();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept redirect connection");
                            continue;
                        }
                    },
                };
                let handler = handler.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, local_addr, &path, handler).await {
                        debug!(peer = %peer, error = %e, "Redirect connection failed");
                    }
                });
            }
            debug!(addr = %local_addr, "Stopped listening for OAuth redirects");
        });

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    mut stream: TcpStream,
    local_addr: SocketAddr,
    path: &str,
    handler: CallbackHandler,
) -> McpResult<()> {
    let mut request_line = String::new();
    {
        let mut reader = BufReader::new(&mut stream).take(MAX_REQUEST_HEAD);
        reader.read_line(&mut request_line).await?;
        // Drain the headers so closing does not reset the connection.
        let mut header = String::new();
        loop {
            header.clear();
            if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
                break;
            }
        }
    }

    let mut parts = request_line.split_whitespace();
    let (status, body) = match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => {
            let url = format!("http://{local_addr}{target}");
            if url::Url::parse(&url).is_ok_and(|u| u.path() == path) {
                match handler(url).await {
                    Ok(()) => (
                        Status::Ok,
                        page(true, "You can close this tab and return to your terminal."),
                    ),
                    Err(e) => {
                        warn!(code = e.code(), error = %e, "OAuth redirect rejected");
                        (Status::BadRequest, page(false, &e.to_string()))
                    }
                }
            } else {
                (Status::NotFound, String::new())
            }
        }
        (Some(_), Some(_)) => (Status::MethodNotAllowed, String::new()),
        _ => (Status::BadRequest, String::new()),
    };

    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        status.line(),
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
