//! Conduit: run, supervise and authorize MCP servers.
//!
//! This is the main entry point for the conduit CLI.

mod commands;

use clap::{Parser, Subcommand};
use conduit_mcp::OrchestratorSettings;
use conduit_util::log::{LogConfig, LogLevel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about = "Run, supervise and authorize MCP servers", long_about = None)]
struct Cli {
    /// Settings file (defaults to conduit.json in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding server configs, state and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print logs to stderr
    #[arg(long, global = true)]
    print_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import servers from an `mcpServers` or `servers` JSON document
    Import {
        /// Path to the document
        file: PathBuf,
        /// Overwrite servers that already exist
        #[arg(long)]
        replace: bool,
    },
    /// List configured servers and their last known state
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a server launched as a child process
    AddStdio {
        /// Server id
        id: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Environment variable, as KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = commands::parse_key_val)]
        env: Vec<(String, String)>,
        /// Do not start the server automatically
        #[arg(long)]
        disabled: bool,
        /// Executable to run
        command: String,
        /// Arguments passed to the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Add a remote streamable-HTTP server
    AddHttp {
        /// Server id
        id: String,
        /// Endpoint URL
        url: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Extra request header, as KEY=VALUE (repeatable)
        #[arg(long = "header", value_parser = commands::parse_key_val)]
        headers: Vec<(String, String)>,
        /// Static bearer token
        #[arg(long, conflicts_with = "oauth")]
        token: Option<String>,
        /// Authorize with OAuth; endpoints are discovered on `conduit auth`
        #[arg(long)]
        oauth: bool,
        /// Do not start the server automatically
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a server
    Remove {
        /// Server id
        id: String,
    },
    /// Start enabled servers and supervise them until interrupted
    Run,
    /// Authorize a server in the browser
    Auth {
        /// Server id
        id: String,
    },
    /// Show a server's state and recorded metadata
    State {
        /// Server id
        id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => OrchestratorSettings::load(path)?,
        None => OrchestratorSettings::load_default()?,
    };
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = Some(dir.clone());
    }
    init_logging(&cli, &settings)?;

    let result = match cli.command {
        Commands::Import { file, replace } => commands::import(&settings, &file, replace).await,
        Commands::List { json } => commands::list(&settings, json).await,
        Commands::AddStdio {
            id,
            name,
            env,
            disabled,
            command,
            args,
        } => {
            let add = commands::AddStdio {
                id,
                name,
                env,
                disabled,
                command,
                args,
            };
            commands::add_stdio(&settings, add).await
        }
        Commands::AddHttp {
            id,
            url,
            name,
            headers,
            token,
            oauth,
            disabled,
        } => {
            let add = commands::AddHttp {
                id,
                url,
                name,
                headers,
                token,
                oauth,
                disabled,
            };
            commands::add_http(&settings, add).await
        }
        Commands::Remove { id } => commands::remove(&settings, &id).await,
        Commands::Run => commands::run(&settings).await,
        Commands::Auth { id } => commands::auth(&settings, &id).await,
        Commands::State { id, json } => commands::state(&settings, &id, json).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Command failed");
    }
    result
}

fn init_logging(cli: &Cli, settings: &OrchestratorSettings) -> anyhow::Result<()> {
    let level = cli
        .log_level
        .as_deref()
        .or(settings.log_level.as_deref())
        .and_then(LogLevel::parse)
        .unwrap_or_default();
    let file = settings
        .data_dir()
        .map(|dir| dir.join("logs").join("conduit.log"));

    conduit_util::log::init(LogConfig {
        print: cli.print_logs,
        level,
        include_location: level == LogLevel::Trace,
        file,
    })?;
    Ok(())
}
