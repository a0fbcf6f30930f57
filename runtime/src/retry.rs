//! Bounded retry with jittered backoff for transient failures.
//!
//! Only errors the caller classifies as retryable are retried. A
//! non-retryable error ends the loop immediately without consuming the
//! remaining attempts.
//!
//! # Example
//!
//! ```rust
//! use order_gateway_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .jitter_factor(0.5)
//!     .build();
//!
//! let outcome = retry_with_predicate(
//!     &policy,
//!     |_attempt| async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("transient"),
//! )
//! .await;
//!
//! assert_eq!(outcome.attempts, 1);
//! assert_eq!(outcome.result, Ok(42));
//! # }
//! ```

use order_gateway_core::config::RetrySettings;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy.
///
/// # Default Values
///
/// - `max_attempts`: 3 (first call included)
/// - `base_delay`: 500ms
/// - `jitter_factor`: 0.5 (delays fall in `[250ms, 750ms]`)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, first call included
    pub max_attempts: u32,
    /// Delay between attempts before jitter
    pub base_delay: Duration,
    /// Relative jitter in `[0, 1)`
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay(),
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder starting from the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Same policy with at most `max_attempts` attempts.
    #[must_use]
    pub fn capped(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts: self.max_attempts.min(max_attempts),
            ..self.clone()
        }
    }

    /// Draw the delay before the next attempt.
    ///
    /// `base_delay * (1 + u)` with `u` uniform in
    /// `[-jitter_factor, jitter_factor]`, drawn independently per call.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let jitter = self.jitter_factor.clamp(0.0, 0.999);
        if jitter <= 0.0 {
            return self.base_delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        self.base_delay.mul_f64(factor)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Set the relative jitter.
    #[must_use]
    pub const fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.policy.jitter_factor = jitter_factor;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Result of a retried operation plus the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T, E> {
    /// Attempts made, first call included
    pub attempts: u32,
    /// Final result
    pub result: Result<T, E>,
}

/// Retry an async operation while `is_retryable` approves the error.
///
/// `operation` receives the 1-based attempt number. A `max_attempts` of zero
/// is treated as one.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `operation` - Async operation to retry
/// * `is_retryable` - Predicate deciding whether an error is worth another attempt
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return RetryOutcome {
                    attempts: attempt,
                    result: Ok(result),
                };
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(attempt, error = %err, "Non-retryable error, giving up");
                    return RetryOutcome {
                        attempts: attempt,
                        result: Err(err),
                    };
                }
                if attempt >= max_attempts {
                    tracing::warn!(attempt, error = %err, "Operation failed after max attempts");
                    return RetryOutcome {
                        attempts: attempt,
                        result: Err(err),
                    };
                }

                let delay = policy.next_delay();
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(1))
            .jitter_factor(0.0)
            .build()
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .jitter_factor(0.25)
            .build();

        for _ in 0..200 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(fast_policy(3).next_delay(), Duration::from_millis(1));
    }

    #[test]
    fn capped_never_raises_the_limit() {
        let policy = fast_policy(3);
        assert_eq!(policy.capped(2).max_attempts, 2);
        assert_eq!(policy.capped(10).max_attempts, 3);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = retry_with_predicate(
            &fast_policy(5),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { Err("transient".to_string()) } else { Ok(n) }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(outcome.result, Ok(2));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let outcome = retry_with_predicate(
            &fast_policy(4),
            |_| async { Err::<(), _>("timeout".to_string()) },
            |_| true,
        )
        .await;

        assert_eq!(outcome.attempts, 4);
        assert!(outcome.result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let outcome = retry_with_predicate(
            &fast_policy(5),
            |attempt| async move {
                if attempt == 1 {
                    Err("transient".to_string())
                } else {
                    Err::<(), _>("permanent".to_string())
                }
            },
            |err: &String| err == "transient",
        )
        .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result, Err("permanent".to_string()));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delay_stays_within_jitter_band(base_ms in 1u64..10_000, jitter in 0.0f64..0.99) {
                let policy = RetryPolicy::builder()
                    .base_delay(Duration::from_millis(base_ms))
                    .jitter_factor(jitter)
                    .build();
                let base = Duration::from_millis(base_ms);
                let slack = Duration::from_micros(1);

                let delay = policy.next_delay();
                prop_assert!(delay + slack >= base.mul_f64(1.0 - jitter));
                prop_assert!(delay <= base.mul_f64(1.0 + jitter) + slack);
            }
        }
    }
}
