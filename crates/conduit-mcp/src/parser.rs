//! Import of server configurations written for other MCP hosts.
//!
//! Accepted shapes, tried in order:
//!
//! 1. an array of server entries,
//! 2. `{"mcpServers": {"<name>": {...}}}`,
//! 3. a single entry with `command` or `url`,
//! 4. a bare map of named entries, `{"<name>": {...}}`.
//!
//! Anything else is rejected.

use crate::error::{McpError, McpResult};
use crate::server::{
    AuthConfig, HttpTransport, ServerCategory, ServerConfig, StdioTransport, TransportConfig,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Detected input shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Array,
    McpServersMap,
    Single,
    BareMap,
}

/// Category keywords, checked in order against name, command, args, url and
/// description.
const CATEGORY_KEYWORDS: &[(&str, ServerCategory)] = &[
    ("postgres", ServerCategory::Database),
    ("mysql", ServerCategory::Database),
    ("sqlite", ServerCategory::Database),
    ("filesystem", ServerCategory::Filesystem),
    ("github", ServerCategory::Development),
    ("gitlab", ServerCategory::Development),
    ("slack", ServerCategory::Communication),
    ("email", ServerCategory::Communication),
    ("gmail", ServerCategory::Communication),
    ("notion", ServerCategory::Productivity),
    ("jira", ServerCategory::Productivity),
    ("openai", ServerCategory::Ai),
    ("claude", ServerCategory::Ai),
    ("stripe", ServerCategory::Api),
    ("supabase", ServerCategory::Api),
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default, alias = "workingDir")]
    cwd: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    disabled: Option<bool>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<ServerCategory>,
    #[serde(default)]
    auth: Option<AuthConfig>,
}

fn is_entry(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key("command") || obj.contains_key("url"))
}

/// Work out which shape `value` has.
pub fn detect_format(value: &Value) -> McpResult<ConfigFormat> {
    match value {
        Value::Array(_) => Ok(ConfigFormat::Array),
        Value::Object(obj) if obj.get("mcpServers").is_some_and(Value::is_object) => {
            Ok(ConfigFormat::McpServersMap)
        }
        Value::Object(_) if is_entry(value) => Ok(ConfigFormat::Single),
        Value::Object(obj) if !obj.is_empty() && obj.values().all(Value::is_object) => {
            Ok(ConfigFormat::BareMap)
        }
        _ => Err(McpError::invalid_config(
            "Expected an array of servers, an \"mcpServers\" map, or a server entry",
        )),
    }
}

/// Parse a JSON document into server configurations.
pub fn parse(input: &str) -> McpResult<Vec<ServerConfig>> {
    let value: Value = serde_json::from_str(input)
        .map_err(|e| McpError::invalid_config(format!("Not valid JSON: {e}")))?;
    parse_value(&value)
}

/// Normalize an already-parsed document.
pub fn parse_value(value: &Value) -> McpResult<Vec<ServerConfig>> {
    let named: Vec<(Option<String>, &Value)> = match detect_format(value)? {
        ConfigFormat::Array => value
            .as_array()
            .map(|items| items.iter().map(|v| (None, v)).collect())
            .unwrap_or_default(),
        ConfigFormat::McpServersMap => named_entries(value.get("mcpServers")),
        ConfigFormat::Single => vec![(None, value)],
        ConfigFormat::BareMap => named_entries(Some(value)),
    };

    let mut used = HashSet::new();
    named
        .into_iter()
        .enumerate()
        .map(|(index, (key, entry))| {
            let raw: RawServerEntry = serde_json::from_value(entry.clone()).map_err(|e| {
                McpError::invalid_config(format!("Server entry {}: {e}", index + 1))
            })?;
            normalize(key, raw, &mut used)
        })
        .collect()
}

fn named_entries(map: Option<&Value>) -> Vec<(Option<String>, &Value)> {
    map.and_then(Value::as_object)
        .map(|obj: &Map<String, Value>| obj.iter().map(|(k, v)| (Some(k.clone()), v)).collect())
        .unwrap_or_default()
}

fn normalize(
    key: Option<String>,
    raw: RawServerEntry,
    used: &mut HashSet<String>,
) -> McpResult<ServerConfig> {
    let name = raw
        .name
        .clone()
        .or(key)
        .or_else(|| raw.id.clone())
        .or_else(|| derived_name(&raw))
        .unwrap_or_else(|| "server".to_string());

    let transport = transport(&name, &raw)?;
    let category = raw.category.unwrap_or_else(|| infer_category(&name, &raw));
    let enabled = match (raw.enabled, raw.disabled) {
        (Some(enabled), _) => enabled,
        (None, Some(disabled)) => !disabled,
        (None, None) => true,
    };

    let base_id = raw
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| conduit_util::id::from_name(&name));
    let id = unique_id(base_id, used);

    Ok(ServerConfig {
        id,
        name,
        enabled,
        transport,
        auth: raw.auth.unwrap_or_default(),
        category,
        description: raw.description,
        timeout_ms: raw.timeout,
    })
}

fn transport(name: &str, raw: &RawServerEntry) -> McpResult<TransportConfig> {
    let missing = || McpError::MissingTransport {
        name: name.to_string(),
    };
    let stdio = || {
        raw.command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .map(|command| {
                TransportConfig::Stdio(StdioTransport {
                    command,
                    args: raw.args.clone(),
                    env: raw.env.clone(),
                    cwd: raw.cwd.clone(),
                })
            })
            .ok_or_else(missing)
    };
    let http = || {
        raw.url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .map(|url| {
                TransportConfig::Http(HttpTransport {
                    url,
                    headers: raw.headers.clone(),
                })
            })
            .ok_or_else(missing)
    };

    match raw.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("stdio") => stdio(),
        Some("http" | "sse" | "streamable-http" | "streamablehttp") => http(),
        Some(other) => Err(McpError::invalid_config(format!(
            "Server '{name}' has unknown transport type '{other}'"
        ))),
        None if raw.command.is_some() => stdio(),
        None => http(),
    }
}

fn derived_name(raw: &RawServerEntry) -> Option<String> {
    if let Some(command) = &raw.command {
        let last_arg = raw.args.iter().rev().find(|a| !a.starts_with('-'));
        let source = last_arg.unwrap_or(command);
        return source
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    raw.url
        .as_deref()
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string))
}

fn infer_category(name: &str, raw: &RawServerEntry) -> ServerCategory {
    let mut haystack = name.to_lowercase();
    for part in raw
        .command
        .iter()
        .chain(raw.args.iter())
        .chain(raw.url.iter())
        .chain(raw.description.iter())
    {
        haystack.push(' ');
        haystack.push_str(&part.to_lowercase());
    }

    CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| haystack.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or_default()
}

fn unique_id(base: String, used: &mut HashSet<String>) -> String {
    let mut id = base.clone();
    let mut n = 2;
    while !used.insert(id.clone()) {
        id = format!("{base}-{n}");
        n += 1;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(&json!([])).unwrap(), ConfigFormat::Array);
        assert_eq!(
            detect_format(&json!({"mcpServers": {}})).unwrap(),
            ConfigFormat::McpServersMap
        );
        assert_eq!(
            detect_format(&json!({"command": "npx"})).unwrap(),
            ConfigFormat::Single
        );
        assert_eq!(
            detect_format(&json!({"x": {"url": "http://h"}})).unwrap(),
            ConfigFormat::BareMap
        );
        assert!(detect_format(&json!("servers")).is_err());
        assert!(detect_format(&json!({})).is_err());
        assert!(detect_format(&json!({"x": 1})).is_err());
    }

    #[test]
    fn test_mcp_servers_map() {
        let servers = parse(r#"{"mcpServers":{"x":{"command":"npx","args":["y"]}}}"#).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "x");
        assert_eq!(servers[0].id, "x");
        assert_eq!(servers[0].transport.kind(), "stdio");
    }

    #[test]
    fn test_bare_map_http() {
        let servers = parse(r#"{"x":{"url":"http://h"}}"#).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "x");
        assert_eq!(servers[0].transport.kind(), "http");
    }

    #[test]
    fn test_missing_transport() {
        let err = parse(r#"{"mcpServers":{"broken":{"args":["a"]}}}"#).unwrap_err();
        assert!(matches!(err, McpError::MissingTransport { ref name } if name == "broken"));

        let err = parse(r#"[{"name":"typed","type":"stdio","url":"http://h"}]"#).unwrap_err();
        assert!(matches!(err, McpError::MissingTransport { .. }));
    }

    #[test]
    fn test_type_hints_and_fields() {
        let servers = parse(
            r#"{"mcpServers":{
                "remote": {"type": "streamable-http", "url": "https://api.example.com/mcp",
                           "headers": {"X-Key": "k"}, "timeout": 1500, "disabled": true},
                "local": {"command": "node", "args": ["srv.js"], "env": {"A": "1"},
                          "workingDir": "/srv", "enabled": false}
            }}"#,
        )
        .unwrap();

        let remote = servers.iter().find(|s| s.name == "remote").unwrap();
        match &remote.transport {
            TransportConfig::Http(http) => assert_eq!(http.headers["X-Key"], "k"),
            other => panic!("expected http, got {other:?}"),
        }
        assert_eq!(remote.timeout_ms, Some(1500));
        assert!(!remote.enabled);

        let local = servers.iter().find(|s| s.name == "local").unwrap();
        match &local.transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.env["A"], "1");
                assert_eq!(stdio.cwd.as_deref(), Some("/srv"));
            }
            other => panic!("expected stdio, got {other:?}"),
        }
        assert!(!local.enabled);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = parse(r#"{"command": "x", "type": "carrier-pigeon"}"#).unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig(_)));
    }

    #[test]
    fn test_category_inference() {
        let servers = parse(
            r#"[
                {"name": "db", "command": "npx", "args": ["@modelcontextprotocol/server-postgres"]},
                {"name": "fs", "command": "npx", "args": ["@modelcontextprotocol/server-filesystem"]},
                {"name": "gh", "command": "gh-mcp", "description": "GitHub issues"},
                {"name": "chat", "url": "https://slack.example.com/mcp"},
                {"name": "docs", "url": "https://mcp.notion.com"},
                {"name": "llm", "command": "openai-mcp"},
                {"name": "pay", "url": "https://mcp.stripe.com"},
                {"name": "misc", "command": "tool"}
            ]"#,
        )
        .unwrap();
        let categories: Vec<ServerCategory> = servers.iter().map(|s| s.category).collect();
        assert_eq!(
            categories,
            vec![
                ServerCategory::Database,
                ServerCategory::Filesystem,
                ServerCategory::Development,
                ServerCategory::Communication,
                ServerCategory::Productivity,
                ServerCategory::Ai,
                ServerCategory::Api,
                ServerCategory::Other,
            ]
        );
    }

    #[test]
    fn test_ids_are_slugged_and_unique() {
        let servers = parse(
            r#"[
                {"name": "My Server", "command": "a"},
                {"name": "my server", "command": "b"},
                {"id": "fixed", "name": "Whatever", "command": "c"}
            ]"#,
        )
        .unwrap();
        let ids: Vec<&str> = servers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["my-server", "my-server-2", "fixed"]);
    }

    #[test]
    fn test_single_entry_name_is_derived() {
        let servers = parse(r#"{"command": "/usr/local/bin/weather-mcp"}"#).unwrap();
        assert_eq!(servers[0].name, "weather-mcp");

        let servers = parse(r#"{"url": "https://mcp.example.com/v1"}"#).unwrap();
        assert_eq!(servers[0].name, "mcp.example.com");
    }
}
