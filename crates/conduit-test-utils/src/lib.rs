//! Test doubles and fixtures for conduit.
//!
//! - **Transports**: [`FakeTransport`] plus process and HTTP adapters that
//!   hand them out and record what they were asked to do
//! - **Browser**: [`RecordingBrowser`], which can answer authorization
//!   requests by itself
//! - **Stores**: in-memory and failing [`ConfigStore`](conduit_mcp::ConfigStore)s
//! - **Builders**: a [`TestHarness`] wiring a registry to all of the above
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use conduit_test_utils::{fast_settings, TestHarness};
//!
//! #[tokio::test]
//! async fn test_start() {
//!     let harness = TestHarness::new(fast_settings());
//!     harness.registry.add(stdio_server("fs")).await.unwrap();
//!     harness.registry.start_server("fs").await.unwrap();
//!     assert_eq!(harness.process.spawn_count(), 1);
//! }
//! ```

pub mod browser;
pub mod builders;
pub mod store;
pub mod transport;

pub use browser::RecordingBrowser;
pub use builders::{fast_settings, http_server, oauth_server, stdio_server, TestHarness};
pub use store::{memory_store, FailingStore};
pub use transport::{FakeHttpAdapter, FakeProcessAdapter, FakeTransport};
