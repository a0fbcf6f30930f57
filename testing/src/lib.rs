//! # Order Gateway Testing
//!
//! Test doubles for the order gateway.
//!
//! This crate provides:
//! - [`InMemoryOrderStore`]: conditional-write order store
//! - [`InMemoryStreamBus`]: streams with consumer groups and a pending-entry index
//! - [`ScriptedPartner`]: partner client replaying queued responses
//! - Deterministic clocks
//!
//! ## Example
//!
//! ```ignore
//! use order_gateway_testing::{InMemoryOrderStore, InMemoryStreamBus, ScriptedPartner, test_clock};
//!
//! #[tokio::test]
//! async fn test_order_flow() {
//!     let store = Arc::new(InMemoryOrderStore::new());
//!     let bus = Arc::new(InMemoryStreamBus::new(config.stream.clone()));
//!     let partner = ScriptedPartner::new().shared();
//!
//!     let service = OrderService::new(store.clone(), bus.clone(), Arc::new(test_clock()), &config.stream);
//!     service.create_order(42).await.unwrap();
//! }
//! ```

use chrono::{DateTime, Utc};
use order_gateway_core::environment::Clock;

mod order_store;
mod partner;
mod stream_bus;

pub use order_store::InMemoryOrderStore;
pub use partner::ScriptedPartner;
pub use stream_bus::InMemoryStreamBus;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use order_gateway_testing::mocks::FixedClock;
    /// use order_gateway_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the code under test.
    ///
    /// # Example
    ///
    /// ```
    /// use order_gateway_testing::mocks::ManualClock;
    /// use order_gateway_core::environment::Clock;
    ///
    /// let clock = ManualClock::default();
    /// let before = clock.now();
    /// clock.advance(chrono::Duration::minutes(5));
    /// assert_eq!(clock.now() - before, chrono::Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward (or back, with a negative delta).
        pub fn advance(&self, delta: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber writing through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,order_gateway=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let handle = clock.clone();
        handle.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), handle.now());
        assert_eq!(clock.now() - test_clock().now(), chrono::Duration::seconds(30));
    }
}
