//! Orchestrator settings.
//!
//! Settings are read from a JSON file (comments allowed), then overridden by
//! `CONDUIT_*` environment variables:
//!
//! - `CONDUIT_DATA_DIR`
//! - `CONDUIT_LOG_LEVEL`
//! - `CONDUIT_MAX_RESTART_ATTEMPTS`
//! - `CONDUIT_HEALTH_CHECK_INTERVAL_MS`
//!
//! Durations are milliseconds throughout.

use crate::error::{McpError, McpResult};
use crate::oauth::default_redirect_uri;
use crate::state::DEFAULT_HISTORY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub supervisor: SupervisorConfig,
    pub token: TokenManagerConfig,
    pub manager: ManagerConfig,
    /// Transitions kept per server.
    pub history_capacity: usize,
    /// Name of the config document holding the server list.
    pub config_name: String,
    pub redirect_uri: String,
    /// Client name sent during dynamic client registration.
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            token: TokenManagerConfig::default(),
            manager: ManagerConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            config_name: "servers".to_string(),
            redirect_uri: default_redirect_uri(),
            client_name: "Conduit".to_string(),
            data_dir: None,
            log_level: None,
        }
    }
}

impl OrchestratorSettings {
    /// Load from `path` and apply environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> McpResult<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| McpError::invalid_config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Load from the default location.
    pub fn load_default() -> McpResult<Self> {
        match conduit_util::path::settings_file() {
            Some(path) => Self::load(&path),
            None => {
                let mut settings = Self::default();
                settings.apply_env_overrides(|key| std::env::var(key).ok());
                Ok(settings)
            }
        }
    }

    /// Parse JSON with `//` and `/* */` comments.
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(&strip_comments(content))
    }

    /// Apply `CONDUIT_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("CONDUIT_DATA_DIR").filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("CONDUIT_LOG_LEVEL").filter(|l| !l.is_empty()) {
            self.log_level = Some(level);
        }
        if let Some(raw) = lookup("CONDUIT_MAX_RESTART_ATTEMPTS") {
            match raw.parse() {
                Ok(n) => self.supervisor.max_restart_attempts = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid CONDUIT_MAX_RESTART_ATTEMPTS"),
            }
        }
        if let Some(raw) = lookup("CONDUIT_HEALTH_CHECK_INTERVAL_MS") {
            match raw.parse() {
                Ok(ms) => self.supervisor.health_check_interval_ms = ms,
                Err(_) => warn!(value = %raw, "Ignoring invalid CONDUIT_HEALTH_CHECK_INTERVAL_MS"),
            }
        }
    }

    /// Data directory, falling back to the platform default.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(conduit_util::path::data_dir)
    }
}

/// Restart backoff and health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub health_checks: bool,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_restart_attempts: 3,
            base_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            health_checks: true,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    /// `min(base * multiplier^attempts, max)`.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Health checks run only when switched on with a non-zero interval.
    pub fn health_checks_enabled(&self) -> bool {
        self.health_checks && self.health_check_interval_ms > 0
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// OAuth token handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenManagerConfig {
    /// Refresh this long before expiry.
    pub refresh_buffer_ms: u64,
    /// Lifetime of an authorization round-trip.
    pub flow_timeout_ms: u64,
    pub background_refresh: bool,
    /// Wait before retrying a failed background refresh while the token is
    /// still valid.
    pub refresh_retry_ms: u64,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_ms: 5 * 60 * 1000,
            flow_timeout_ms: 5 * 60 * 1000,
            background_refresh: true,
            refresh_retry_ms: 30 * 1000,
        }
    }
}

impl TokenManagerConfig {
    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_millis(self.refresh_buffer_ms)
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_timeout_ms)
    }

    pub fn refresh_retry(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_ms)
    }
}

/// Start/stop behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound for spawn/connect plus handshake, unless a server sets its own.
    pub startup_timeout_ms: u64,
    /// Grace period between terminate and kill.
    pub stop_timeout_ms: u64,
    /// List tools/resources/prompts after a successful start.
    pub fetch_capabilities: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 30_000,
            stop_timeout_ms: 5_000,
            fetch_capabilities: true,
        }
    }
}

impl ManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Strip `//` and `/* */` comments outside of strings.
pub fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }
        if in_string {
            if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            result.push(c);
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    if c == '\n' {
                        result.push('\n');
                    }
                    prev = c;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.supervisor.max_restart_attempts, 3);
        assert_eq!(settings.token.refresh_buffer(), Duration::from_secs(300));
        assert_eq!(settings.manager.stop_timeout(), Duration::from_secs(5));
        assert_eq!(settings.history_capacity, 50);
        assert_eq!(settings.client_name, "Conduit");
        assert_eq!(
            settings.redirect_uri,
            "http://127.0.0.1:19876/mcp/oauth/callback"
        );
    }

    #[test]
    fn test_backoff_delay() {
        let config = SupervisorConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(5_000));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(10_000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(40_000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(60_000));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn test_parse_partial_with_comments() {
        let settings = OrchestratorSettings::parse(
            r#"{
                // tighter restarts
                "supervisor": { "base_delay_ms": 100, "max_restart_attempts": 5 },
                /* keep the rest */
                "redirect_uri": "http://localhost:1/cb"
            }"#,
        )
        .unwrap();
        assert_eq!(settings.supervisor.base_delay_ms, 100);
        assert_eq!(settings.supervisor.max_restart_attempts, 5);
        assert_eq!(settings.supervisor.max_delay_ms, 60_000);
        assert_eq!(settings.redirect_uri, "http://localhost:1/cb");
    }

    #[test]
    fn test_strip_comments_keeps_strings() {
        let stripped = strip_comments(r#"{"url": "http://x//y", "a": "q\"//"} // tail"#);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["url"], "http://x//y");
        assert_eq!(value["a"], "q\"//");
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("CONDUIT_DATA_DIR", "/var/lib/conduit"),
            ("CONDUIT_LOG_LEVEL", "debug"),
            ("CONDUIT_MAX_RESTART_ATTEMPTS", "7"),
            ("CONDUIT_HEALTH_CHECK_INTERVAL_MS", "not-a-number"),
        ]);
        let mut settings = OrchestratorSettings::default();
        settings.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.data_dir, Some(PathBuf::from("/var/lib/conduit")));
        assert_eq!(settings.log_level.as_deref(), Some("debug"));
        assert_eq!(settings.supervisor.max_restart_attempts, 7);
        assert_eq!(settings.supervisor.health_check_interval_ms, 30_000);
    }

    #[test]
    fn test_zero_health_interval_disables_health_checks() {
        let env = HashMap::from([("CONDUIT_HEALTH_CHECK_INTERVAL_MS", "0")]);
        let mut settings = OrchestratorSettings::default();
        assert!(settings.supervisor.health_checks_enabled());

        settings.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(settings.supervisor.health_check_interval_ms, 0);
        assert!(!settings.supervisor.health_checks_enabled());

        let parsed =
            OrchestratorSettings::parse(r#"{"supervisor": {"health_check_interval_ms": 0}}"#).unwrap();
        assert!(!parsed.supervisor.health_checks_enabled());
    }

    #[test]
    fn test_load_missing_and_invalid_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(OrchestratorSettings::load(&missing).is_ok());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            OrchestratorSettings::load(&bad),
            Err(McpError::InvalidConfig(_))
        ));
    }
}
