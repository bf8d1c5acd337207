//! Logging setup using tracing.
//!
//! The CLI logs to `<data dir>/logs/conduit.log` and, with `--print-logs`,
//! to stderr. Stdout stays free for command output and event lines.

use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::{fmt as layer_fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Case-insensitive; accepts `warning` for [`LogLevel::Warn`].
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Filter directives for this level. HTTP and file-watching internals
    /// stay at `warn` unless tracing everything.
    pub fn directives(&self) -> String {
        match self {
            LogLevel::Trace => "trace".to_string(),
            level => format!("{},hyper=warn,reqwest=warn,notify=warn", level.as_str()),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Also write to stderr.
    pub print: bool,
    /// `RUST_LOG` takes precedence when set.
    pub level: LogLevel,
    /// Include file and line of each event.
    pub include_location: bool,
    /// Append to this file, without ANSI colors.
    pub file: Option<PathBuf>,
}

/// Install the global subscriber.
///
/// Call once at startup. A second call leaves the first subscriber in place.
pub fn init(config: LogConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.directives()));

    let stderr_layer = config.print.then(|| {
        layer_fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(config.include_location)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
    });

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                layer_fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
        }
        None => None,
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}

/// Span carrying the id of the server an operation belongs to.
#[macro_export]
macro_rules! server_span {
    ($id:expr) => {
        tracing::info_span!("server", id = %$id)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" DEBUG "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!("error".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_directives_quiet_dependencies() {
        assert_eq!(LogLevel::Trace.directives(), "trace");
        let info = LogLevel::Info.directives();
        assert!(info.starts_with("info,"));
        assert!(info.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&info).is_ok());
    }

    #[test]
    fn test_init_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("conduit.log");
        init(LogConfig {
            file: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
        assert!(path.exists());
    }
}
