//! CLI integration tests.
//!
//! These run the binary against a throwaway data directory. None of them
//! starts a server.

use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn conduit(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_conduit"))
        .arg("--config")
        .arg(dir.join("conduit.json"))
        .arg("--data-dir")
        .arg(dir.join("data"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("CONDUIT_DATA_DIR")
        .output()
        .expect("Failed to execute conduit")
}

fn list_json(dir: &Path) -> Vec<Value> {
    let output = conduit(dir, &["list", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).expect("list --json prints JSON")
}

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_conduit"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("supervise"));
    assert!(stdout.contains("add-stdio"));
    assert!(stdout.contains("--data-dir"));
}

#[test]
fn test_list_empty() {
    let dir = TempDir::new().unwrap();
    let output = conduit(dir.path(), &["list"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No MCP servers configured"));
}

#[test]
fn test_add_list_remove() {
    let dir = TempDir::new().unwrap();

    let output = conduit(
        dir.path(),
        &["add-stdio", "fs", "--env", "ROOT=/tmp", "npx", "-y", "@modelcontextprotocol/server-filesystem"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let output = conduit(
        dir.path(),
        &["add-http", "remote", "https://mcp.example.com/mcp", "--token", "secret", "--disabled"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let rows = list_json(dir.path());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "fs");
    assert_eq!(rows[0]["transport"], "stdio");
    assert_eq!(rows[0]["endpoint"], "npx -y @modelcontextprotocol/server-filesystem");
    assert_eq!(rows[0]["state"], "IDLE");
    assert_eq!(rows[1]["id"], "remote");
    assert_eq!(rows[1]["enabled"], false);

    let output = conduit(dir.path(), &["remove", "fs"]);
    assert!(output.status.success());
    let rows = list_json(dir.path());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "remote");
}

#[test]
fn test_add_duplicate_fails() {
    let dir = TempDir::new().unwrap();
    assert!(conduit(dir.path(), &["add-stdio", "fs", "server"]).status.success());

    let output = conduit(dir.path(), &["add-stdio", "fs", "server"]);
    assert!(!output.status.success());
    assert_eq!(list_json(dir.path()).len(), 1);
}

#[test]
fn test_add_http_rejects_bad_url() {
    let dir = TempDir::new().unwrap();
    let output = conduit(dir.path(), &["add-http", "remote", "ftp://example.com"]);
    assert!(!output.status.success());
    assert!(list_json(dir.path()).is_empty());
}

#[test]
fn test_import_document() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("claude_desktop_config.json");
    std::fs::write(
        &doc,
        r#"{
            "mcpServers": {
                "github": {"url": "https://api.githubcopilot.com/mcp/"},
                "sqlite": {"command": "uvx", "args": ["mcp-server-sqlite", "--db-path", "test.db"]}
            }
        }"#,
    )
    .unwrap();
    let doc = doc.to_string_lossy().to_string();

    let output = conduit(dir.path(), &["import", &doc]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Added 'github'"));
    assert!(stdout.contains("Added 'sqlite'"));

    let output = conduit(dir.path(), &["import", &doc]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Skipped"));
    assert_eq!(list_json(dir.path()).len(), 2);
}

#[test]
fn test_state_of_unknown_server_fails() {
    let dir = TempDir::new().unwrap();
    let output = conduit(dir.path(), &["state", "missing"]);
    assert!(!output.status.success());
}

#[test]
fn test_state_json() {
    let dir = TempDir::new().unwrap();
    assert!(conduit(dir.path(), &["add-stdio", "fs", "server"]).status.success());

    let output = conduit(dir.path(), &["state", "fs", "--json"]);
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["id"], "fs");
    assert_eq!(value["state"], "IDLE");
    assert!(value["history"].is_array());
}
