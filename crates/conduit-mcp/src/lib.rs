//! MCP server orchestration for conduit.
//!
//! Conduit keeps a set of configured MCP servers running: it validates
//! their configs, authorizes them with OAuth when they need it, spawns or
//! connects to them, restarts them when they crash and persists everything
//! it learns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────────┐     ┌──────────────────────┐
//! │ Registry │────▶│ ServerManager │────▶│ stdio / HTTP servers │
//! │          │     └───────────────┘     └──────────────────────┘
//! │          │────▶ Supervisor    (restart backoff, health checks)
//! │          │────▶ TokenManager  (PKCE flow, refresh)
//! │          │────▶ ConfigStore   (servers, server_states, oauth_state_*)
//! └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use conduit_mcp::{
//!     OrchestratorSettings, Registry, RegistryDeps, ReqwestHttpAdapter, ServerConfig,
//!     StoreAdapter, SystemBrowser, TokioProcessAdapter,
//! };
//! use conduit_storage::JsonStorage;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let deps = RegistryDeps {
//!     store: Arc::new(StoreAdapter::new(JsonStorage::new("/tmp/conduit"))),
//!     process: Arc::new(TokioProcessAdapter::new()),
//!     http: Arc::new(ReqwestHttpAdapter::new()?),
//!     browser: Arc::new(SystemBrowser::new()),
//!     http_client: reqwest::Client::new(),
//! };
//! let registry = Registry::new(deps, OrchestratorSettings::default());
//! registry.initialize().await?;
//!
//! registry
//!     .add(ServerConfig::stdio(
//!         "filesystem",
//!         "npx",
//!         ["-y", "@modelcontextprotocol/server-filesystem"],
//!     ))
//!     .await?;
//! registry.start_server("filesystem").await?;
//!
//! registry.dispose().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod instance;
mod listener;

pub mod browser;
pub mod callback;
pub mod discovery;
pub mod http;
pub mod manager;
pub mod oauth;
pub mod parser;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod settings;
pub mod state;
pub mod stdio;
pub mod store;
pub mod supervisor;
pub mod token;
pub mod transport;

pub use browser::{BrowserAdapter, CallbackHandler, ProtocolHandlerGuard, SystemBrowser};
pub use discovery::AuthDiscovery;
pub use error::{McpError, McpResult};
pub use http::ReqwestHttpAdapter;
pub use instance::ServerInstance;
pub use listener::{Listeners, Subscription};
pub use manager::{ServerManager, StartOptions, StopOptions};
pub use oauth::{OAuthFlowState, OAuthTokens};
pub use parser::ConfigFormat;
pub use protocol::Capabilities;
pub use registry::{ImportOptions, ImportReport, Registry, RegistryDeps, RegistryEvent};
pub use server::{
    AuthConfig, HttpTransport, OAuthConfig, ServerCategory, ServerConfig, StdioTransport,
    TransportConfig,
};
pub use settings::{ManagerConfig, OrchestratorSettings, SupervisorConfig, TokenManagerConfig};
pub use state::{
    HistoryEntry, MetadataPatch, ServerState, StateChange, StateEvent, StateMachine, StateMetadata,
};
pub use stdio::TokioProcessAdapter;
pub use store::{ConfigStore, StoreAdapter};
pub use supervisor::{SupervisionRecord, Supervisor, SupervisorEvent, SupervisorHooks};
pub use token::{TokenEvent, TokenManager};
pub use transport::{ExitStatus, HttpAdapter, ProcessAdapter, TransportHandle};
