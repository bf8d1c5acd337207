//! Shared utilities for conduit.
//!
//! This crate provides common utilities used across the conduit workspace:
//! - Logging setup with tracing
//! - Server id slugs and ULID-based fallback ids
//! - Data and configuration directories
//! - Unix-millisecond timestamps
//! - RAII-based timing for operation measurement

pub mod id;
pub mod log;
pub mod path;
pub mod time;
pub mod timing;

pub use time::now_ms;
pub use timing::TimingGuard;
