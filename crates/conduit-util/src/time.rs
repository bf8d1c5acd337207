//! Unix-millisecond timestamps.
//!
//! Expiry instants (tokens, OAuth flow state) are persisted as absolute
//! milliseconds since the epoch.

use chrono::Utc;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds left until `deadline_ms`, zero once it has passed.
pub fn remaining_ms(deadline_ms: i64) -> u64 {
    deadline_ms.saturating_sub(now_ms()).max(0) as u64
}
