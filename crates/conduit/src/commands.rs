//! Command handlers for the conduit CLI.

use anyhow::Context;
use conduit_mcp::registry::STATE_SNAPSHOT_NAME;
use conduit_mcp::{
    AuthConfig, ConfigStore, ImportOptions, OAuthConfig, OrchestratorSettings, ReqwestHttpAdapter,
    Registry, RegistryDeps, ServerConfig, ServerState, StoreAdapter, SystemBrowser,
    TokioProcessAdapter, TransportConfig,
};
use conduit_storage::JsonStorage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Parse a `KEY=VALUE` argument.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

struct Workspace {
    registry: Registry,
    store: Arc<dyn ConfigStore>,
}

/// Build a registry over the JSON store in the data directory and load it.
async fn open(settings: &OrchestratorSettings) -> anyhow::Result<Workspace> {
    let data_dir = settings
        .data_dir()
        .context("No data directory available, pass --data-dir")?;
    let store: Arc<dyn ConfigStore> =
        Arc::new(StoreAdapter::new(JsonStorage::new(data_dir.join("data"))));
    let http_client = reqwest::Client::new();

    let registry = Registry::new(
        RegistryDeps {
            store: store.clone(),
            process: Arc::new(TokioProcessAdapter::new()),
            http: Arc::new(ReqwestHttpAdapter::with_client(http_client.clone())),
            browser: Arc::new(SystemBrowser::new()),
            http_client,
        },
        settings.clone(),
    );
    registry.load().await?;
    Ok(Workspace { registry, store })
}

pub async fn import(settings: &OrchestratorSettings, file: &Path, replace: bool) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let ws = open(settings).await?;
    let report = ws
        .registry
        .import(
            &content,
            ImportOptions {
                replace_existing: replace,
            },
        )
        .await?;

    for id in &report.added {
        println!("✓ Added '{id}'");
    }
    for id in &report.updated {
        println!("✓ Updated '{id}'");
    }
    for id in &report.skipped {
        println!("- Skipped '{id}' (already configured, use --replace to overwrite)");
    }
    Ok(())
}

pub async fn list(settings: &OrchestratorSettings, json: bool) -> anyhow::Result<()> {
    let ws = open(settings).await?;
    let snapshot: HashMap<String, ServerState> = match ws.store.read_config(STATE_SNAPSHOT_NAME).await? {
        Some(value) => serde_json::from_value(value).unwrap_or_default(),
        None => HashMap::new(),
    };
    let servers = ws.registry.list();

    if json {
        let rows: Vec<Value> = servers
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "name": c.name,
                    "transport": c.transport.kind(),
                    "enabled": c.enabled,
                    "endpoint": endpoint(c),
                    "state": snapshot.get(&c.id).copied().unwrap_or(ServerState::Idle),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    println!("{:<20} {:<8} {:<8} {:<14} {}", "ID", "TYPE", "ENABLED", "STATE", "ENDPOINT");
    println!("{}", "-".repeat(72));
    for config in &servers {
        let state = snapshot.get(&config.id).copied().unwrap_or(ServerState::Idle);
        let mut endpoint = endpoint(config);
        if endpoint.chars().count() > 40 {
            endpoint = format!("{}...", endpoint.chars().take(37).collect::<String>());
        }
        println!(
            "{:<20} {:<8} {:<8} {:<14} {}",
            config.id,
            config.transport.kind(),
            if config.enabled { "yes" } else { "no" },
            state.as_str(),
            endpoint
        );
    }
    Ok(())
}

fn endpoint(config: &ServerConfig) -> String {
    match &config.transport {
        TransportConfig::Stdio(stdio) => std::iter::once(stdio.command.as_str())
            .chain(stdio.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        TransportConfig::Http(http) => http.url.clone(),
    }
}

/// Arguments of `add-stdio`.
pub struct AddStdio {
    pub id: String,
    pub name: Option<String>,
    pub env: Vec<(String, String)>,
    pub disabled: bool,
    pub command: String,
    pub args: Vec<String>,
}

pub async fn add_stdio(settings: &OrchestratorSettings, add: AddStdio) -> anyhow::Result<()> {
    let mut config = ServerConfig::stdio(&add.id, add.command, add.args);
    if let Some(name) = add.name {
        config = config.with_name(name);
    }
    for (key, value) in add.env {
        config = config.with_env(key, value);
    }
    if add.disabled {
        config = config.disabled();
    }
    add_server(settings, config).await
}

/// Arguments of `add-http`.
pub struct AddHttp {
    pub id: String,
    pub url: String,
    pub name: Option<String>,
    pub headers: Vec<(String, String)>,
    pub token: Option<String>,
    pub oauth: bool,
    pub disabled: bool,
}

pub async fn add_http(settings: &OrchestratorSettings, add: AddHttp) -> anyhow::Result<()> {
    let mut config = ServerConfig::http(&add.id, add.url);
    if let Some(name) = add.name {
        config = config.with_name(name);
    }
    for (key, value) in add.headers {
        config = config.with_header(key, value);
    }
    if let Some(token) = add.token {
        config = config.with_auth(AuthConfig::Token { token });
    } else if add.oauth {
        config = config.with_auth(AuthConfig::OAuth(OAuthConfig::default()));
    }
    if add.disabled {
        config = config.disabled();
    }
    add_server(settings, config).await
}

async fn add_server(settings: &OrchestratorSettings, config: ServerConfig) -> anyhow::Result<()> {
    conduit_mcp::manager::validate(&config)?;
    let id = config.id.clone();
    let ws = open(settings).await?;
    ws.registry.add(config).await?;
    println!("✓ Added MCP server '{id}'");
    Ok(())
}

pub async fn remove(settings: &OrchestratorSettings, id: &str) -> anyhow::Result<()> {
    let ws = open(settings).await?;
    ws.registry.remove(id).await?;
    println!("✓ Removed MCP server '{id}'");
    Ok(())
}

pub async fn auth(settings: &OrchestratorSettings, id: &str) -> anyhow::Result<()> {
    let ws = open(settings).await?;
    println!("Opening the browser to authorize '{id}'...");
    ws.registry.authenticate(id).await?;
    println!("✓ Authorized '{id}'");
    ws.registry.tokens().dispose();
    Ok(())
}

pub async fn state(settings: &OrchestratorSettings, id: &str, json: bool) -> anyhow::Result<()> {
    let ws = open(settings).await?;
    let config = ws
        .registry
        .get(id)
        .with_context(|| format!("MCP server '{id}' not found"))?;
    let last_known = ws
        .store
        .read_config(STATE_SNAPSHOT_NAME)
        .await?
        .and_then(|v| v.get(id).cloned())
        .and_then(|v| serde_json::from_value::<ServerState>(v).ok())
        .unwrap_or(ServerState::Idle);
    let metadata = ws.registry.metadata(id)?;
    let history = ws.registry.history(id)?;

    if json {
        let out = json!({
            "id": config.id,
            "state": last_known,
            "metadata": metadata,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{} ({})", config.name, config.id);
    println!("  state:     {last_known}");
    println!("  transport: {} {}", config.transport.kind(), endpoint(&config));
    if let Some(message) = &metadata.error_message {
        let code = metadata.error_code.as_deref().unwrap_or("UNKNOWN");
        println!("  error:     {code}: {message}");
    }
    if let Some(code) = metadata.exit_code {
        println!("  exit code: {code}");
    }
    if !history.is_empty() {
        println!("  history:");
        for entry in &history {
            println!(
                "    {} {} -> {} ({}{})",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.from,
                entry.to,
                entry.event,
                if entry.forced { ", restored" } else { "" }
            );
        }
    }
    Ok(())
}

/// Start everything and stream registry and supervisor events as JSON
/// lines until Ctrl-C.
pub async fn run(settings: &OrchestratorSettings) -> anyhow::Result<()> {
    let ws = open(settings).await?;
    let registry = ws.registry;

    let mut events = registry.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let mut supervision = registry.supervisor().subscribe();
    let supervisor_printer = tokio::spawn(async move {
        loop {
            match supervision.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    registry.initialize().await?;
    info!(servers = registry.len(), "Supervising servers, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    registry.dispose().await;
    printer.abort();
    supervisor_printer.abort();
    Ok(())
}
