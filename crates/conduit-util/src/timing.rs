//! Duration logging for lifecycle operations.
//!
//! ```rust,ignore
//! let _timing = TimingGuard::server("start", "github");
//! // spawn, handshake ...
//! // logged when dropped: debug under 250 ms, info under 5 s, warn above
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NOTABLE: Duration = Duration::from_millis(250);
const SLOW: Duration = Duration::from_secs(5);

/// Logs how long it lived, at a level that grows with the duration.
#[must_use = "the duration is measured until the guard is dropped"]
pub struct TimingGuard {
    operation: &'static str,
    subject: String,
    started: Instant,
}

impl TimingGuard {
    /// Time `operation` on an arbitrary subject such as `"registry"`.
    pub fn new(operation: &'static str, subject: impl Into<String>) -> Self {
        Self {
            operation,
            subject: subject.into(),
            started: Instant::now(),
        }
    }

    /// Time `operation` on one server.
    pub fn server(operation: &'static str, server_id: &str) -> Self {
        Self::new(operation, server_id)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let elapsed = self.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let (operation, subject) = (self.operation, self.subject.as_str());
        if elapsed >= SLOW {
            warn!(operation, subject, duration_ms, "Slow {operation}");
        } else if elapsed >= NOTABLE {
            info!(operation, subject, duration_ms, "Finished {operation}");
        } else {
            debug!(operation, subject, duration_ms, "Finished {operation}");
        }
    }
}
