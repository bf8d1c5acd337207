//! The slice of MCP the orchestrator speaks.
//!
//! Enough JSON-RPC to bring a server up and read what it offers:
//! `initialize`, `notifications/initialized`, `ping` and the three `*/list`
//! methods. Everything else a server sends is ignored.
//! See: <https://spec.modelcontextprotocol.io/>

use crate::error::{McpError, McpResult};
use crate::transport::TransportHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const JSONRPC: &str = "2.0";

/// Outgoing call or notification.
#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn call(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC,
            id: Some(id),
            method,
            params,
        }
    }

    pub fn notification(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC,
            id: None,
            method,
            params,
        }
    }

    /// The `initialize` call, as sent during the handshake.
    pub fn initialize(id: u64) -> Self {
        Self::call(id, "initialize", Some(initialize_params()))
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }
}

/// Anything a server writes back. Only replies carry `result` or `error`;
/// server-initiated requests and notifications carry `method` instead.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Message {
    /// Id of the call this message answers. Ids sent as strings are
    /// accepted, since some servers echo them that way.
    pub fn reply_to(&self) -> Option<u64> {
        if self.method.is_some() || (self.result.is_none() && self.error.is_none()) {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// The result of `method`, or the server's error as
    /// [`McpError::Protocol`].
    pub fn into_result(self, method: &str) -> McpResult<Value> {
        match self.error {
            Some(error) => Err(McpError::protocol(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "conduit",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// What the server said about itself in reply to `initialize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<Implementation>,
}

impl InitializeResult {
    /// Whether the server advertised `capability` (e.g. `"prompts"`).
    pub fn offers(&self, capability: &str) -> bool {
        self.capabilities.get(capability).is_some_and(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// What a running server offers, as last fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: Vec<ToolInfo>,
    pub resources: Vec<ResourceInfo>,
    pub prompts: Vec<PromptInfo>,
    pub fetched_at: DateTime<Utc>,
}

/// Run the `initialize` / `notifications/initialized` exchange.
pub async fn handshake(handle: &dyn TransportHandle) -> McpResult<InitializeResult> {
    let result = handle.request("initialize", Some(initialize_params())).await?;
    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::protocol(format!("Invalid initialize result: {e}")))?;

    debug!(
        server = %handle.server_id(),
        protocol = %init.protocol_version,
        server_name = ?init.server_info.as_ref().map(|i| &i.name),
        "Handshake complete"
    );

    handle.notify("notifications/initialized", None).await?;
    Ok(init)
}

/// List tools, resources and prompts.
///
/// `tools/list` must succeed. Resources and prompts are optional for
/// servers, so either list failing is logged and treated as empty.
pub async fn fetch_capabilities(handle: &dyn TransportHandle) -> McpResult<Capabilities> {
    let tools = list(handle, "tools/list", "tools").await?;
    let resources = optional_list(handle, "resources/list", "resources").await;
    let prompts = optional_list(handle, "prompts/list", "prompts").await;

    Ok(Capabilities {
        tools,
        resources,
        prompts,
        fetched_at: Utc::now(),
    })
}

pub async fn ping(handle: &dyn TransportHandle) -> McpResult<()> {
    handle.request("ping", None).await.map(|_| ())
}

/// Call `method` and decode the array under `field` of its result. A
/// missing field reads as empty.
async fn list<T: serde::de::DeserializeOwned>(
    handle: &dyn TransportHandle,
    method: &str,
    field: &str,
) -> McpResult<Vec<T>> {
    let mut result = handle.request(method, None).await?;
    let items = match result.get_mut(field) {
        Some(items) => items.take(),
        None => return Ok(Vec::new()),
    };
    serde_json::from_value(items).map_err(|e| {
        warn!(server = %handle.server_id(), method, error = %e, "Malformed list result");
        McpError::protocol(format!("Invalid {method} result: {e}"))
    })
}

async fn optional_list<T: serde::de::DeserializeOwned>(
    handle: &dyn TransportHandle,
    method: &str,
    field: &str,
) -> Vec<T> {
    list(handle, method, field).await.unwrap_or_else(|e| {
        debug!(server = %handle.server_id(), error = %e, "{method} unavailable");
        Vec::new()
    })
}
