//! Injected dependencies that would otherwise be ambient.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts wall-clock time for testability.
///
/// Order timestamps and sweep staleness are computed from this clock.
/// Backoff delays and breaker timeouts use the monotonic `tokio::time`
/// instead.
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
