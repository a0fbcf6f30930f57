//! Resilience layer for outbound partner calls.
//!
//! [`CallGuard`] owns one [`CircuitBreaker`] per destination and a
//! [`RetryPolicy`]. Every attempt goes through the destination's breaker:
//! an open circuit ends the retry loop at once, transient failures are
//! retried with jittered backoff, permanent failures stop immediately.
//!
//! The guard reports how many partner calls it actually made, on success
//! and on failure, so callers can charge them against an order's budget.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::retry::{RetryPolicy, retry_with_predicate};
use order_gateway_core::config::ResilienceConfig;
use order_gateway_core::error::GatewayError;
use order_gateway_core::partner::PartnerError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::time::Instant;

/// Destination name for request creation.
pub const CREATE_REQUEST: &str = "partner.create_request";
/// Destination name for result lookups.
pub const GET_RESULT: &str = "partner.get_result";

/// Terminal failure of a guarded call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// The destination's circuit is open
    #[error("Circuit open for destination '{destination}'")]
    CircuitOpen {
        /// Destination name
        destination: String,
    },

    /// All attempts failed with transient errors
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: PartnerError,
    },

    /// The partner rejected the call
    #[error("Permanent failure: {0}")]
    Permanent(PartnerError),
}

impl ResilienceError {
    /// Whether a later delivery could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl From<ResilienceError> for GatewayError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen { destination } => Self::CircuitOpen(destination),
            ResilienceError::Exhausted { last, .. } => Self::TransientUpstream(last.to_string()),
            ResilienceError::Permanent(error) => Self::PermanentUpstream(error.to_string()),
        }
    }
}

/// Result of [`CallGuard::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedOutcome<T> {
    /// Partner calls actually made (rejected attempts excluded)
    pub attempts: u32,
    /// Final result
    pub result: Result<T, ResilienceError>,
}

/// Single attempt failure inside the retry loop.
#[derive(Debug)]
enum AttemptError {
    Open,
    Partner(PartnerError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("circuit open"),
            Self::Partner(e) => e.fmt(f),
        }
    }
}

/// Circuit breakers plus retry for partner destinations.
#[derive(Debug)]
pub struct CallGuard {
    config: ResilienceConfig,
    retry: RetryPolicy,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CallGuard {
    /// Build a guard from configuration.
    #[must_use]
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            config: config.clone(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// The breaker for `destination`, created on first use.
    #[must_use]
    pub fn breaker(&self, destination: &str) -> CircuitBreaker {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(destination.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(
                    destination,
                    CircuitBreakerConfig::from(self.config.breaker_for(destination)),
                )
            })
            .clone()
    }

    /// Whether `err` is one of the configured transient conditions.
    #[must_use]
    pub fn is_transient(&self, err: &PartnerError) -> bool {
        match err {
            PartnerError::Timeout(_) | PartnerError::Connect(_) | PartnerError::NotReady => true,
            PartnerError::Status { status, .. } => {
                self.config.retry.retry_status_codes.contains(status)
            }
            PartnerError::Decode(_) => false,
        }
    }

    /// Call `operation` against `destination` with at most `max_attempts`
    /// attempts (further capped by the retry policy; zero is treated as one).
    pub async fn call<T, F, Fut>(
        &self,
        destination: &str,
        max_attempts: u32,
        mut operation: F,
    ) -> GuardedOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PartnerError>>,
    {
        let breaker = self.breaker(destination);
        let policy = self.retry.capped(max_attempts);

        let outcome = retry_with_predicate(
            &policy,
            |attempt| {
                // No permit, no call: the operation is not even constructed.
                let admitted = breaker.try_acquire().ok().map(|permit| (permit, operation()));
                async move {
                    let started = Instant::now();
                    let result = match admitted {
                        None => Err(CircuitBreakerError::Open),
                        Some((permit, call)) => permit.settle(call.await, |e| self.is_transient(e)),
                    };
                    let outcome_label = match &result {
                        Ok(_) => "success",
                        Err(CircuitBreakerError::Open) => "rejected",
                        Err(CircuitBreakerError::Inner(e)) if self.is_transient(e) => "transient",
                        Err(CircuitBreakerError::Inner(_)) => "permanent",
                    };
                    metrics::counter!(
                        "gateway_partner_calls_total",
                        "destination" => destination.to_string(),
                        "outcome" => outcome_label
                    )
                    .increment(1);
                    if outcome_label != "rejected" {
                        metrics::histogram!(
                            "gateway_partner_call_duration_seconds",
                            "destination" => destination.to_string()
                        )
                        .record(started.elapsed().as_secs_f64());
                    }
                    tracing::debug!(destination, attempt, outcome = outcome_label, "Partner call");
                    result.map_err(|e| match e {
                        CircuitBreakerError::Open => AttemptError::Open,
                        CircuitBreakerError::Inner(e) => AttemptError::Partner(e),
                    })
                }
            },
            |err| matches!(err, AttemptError::Partner(e) if self.is_transient(e)),
        )
        .await;

        match outcome.result {
            Ok(value) => GuardedOutcome {
                attempts: outcome.attempts,
                result: Ok(value),
            },
            Err(AttemptError::Open) => GuardedOutcome {
                // The rejected attempt never reached the partner.
                attempts: outcome.attempts - 1,
                result: Err(ResilienceError::CircuitOpen {
                    destination: destination.to_string(),
                }),
            },
            Err(AttemptError::Partner(e)) if self.is_transient(&e) => GuardedOutcome {
                attempts: outcome.attempts,
                result: Err(ResilienceError::Exhausted {
                    attempts: outcome.attempts,
                    last: e,
                }),
            },
            Err(AttemptError::Partner(e)) => GuardedOutcome {
                attempts: outcome.attempts,
                result: Err(ResilienceError::Permanent(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::State;
    use order_gateway_core::config::{BreakerSettings, RetrySettings};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn guard(max_failures: u32, max_attempts: u32) -> CallGuard {
        CallGuard::new(&ResilienceConfig {
            breaker: BreakerSettings {
                max_failures,
                reset_timeout_secs: 60,
                failure_window_secs: 60,
            },
            retry: RetrySettings {
                max_attempts,
                base_delay_ms: 1,
                jitter_factor: 0.0,
                ..RetrySettings::default()
            },
            ..ResilienceConfig::default()
        })
    }

    fn status(code: u16) -> PartnerError {
        PartnerError::Status {
            status: code,
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn success_reports_one_attempt() {
        let guard = guard(5, 3);
        let outcome = guard.call(CREATE_REQUEST, 3, || async { Ok(7) }).await;
        assert_eq!(outcome, GuardedOutcome { attempts: 1, result: Ok(7) });
    }

    #[tokio::test]
    async fn transient_errors_exhaust_the_budget() {
        let guard = guard(10, 3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = guard
            .call(CREATE_REQUEST, 3, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(status(503)) }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            outcome.result,
            Err(ResilienceError::Exhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn caller_budget_caps_the_policy() {
        let guard = guard(10, 5);
        let outcome = guard
            .call(CREATE_REQUEST, 2, || async { Err::<(), _>(PartnerError::Timeout("read".into())) })
            .await;
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn permanent_error_stops_and_keeps_circuit_closed() {
        let guard = guard(1, 5);
        let outcome = guard
            .call(CREATE_REQUEST, 5, || async { Err::<(), _>(status(400)) })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(ResilienceError::Permanent(_))));
        assert_eq!(guard.breaker(CREATE_REQUEST).state(), State::Closed);
    }

    #[tokio::test]
    async fn circuit_opening_mid_loop_stops_retrying() {
        let guard = guard(2, 5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = guard
            .call(CREATE_REQUEST, 5, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(PartnerError::Connect("refused".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            outcome.result,
            Err(ResilienceError::CircuitOpen {
                destination: CREATE_REQUEST.to_string()
            })
        );
    }

    #[tokio::test]
    async fn open_circuit_makes_no_calls() {
        let guard = guard(1, 3);
        let _ = guard
            .call(GET_RESULT, 1, || async { Err::<(), _>(status(500)) })
            .await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = guard
            .call(GET_RESULT, 3, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(outcome.result, Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn breakers_are_per_destination() {
        let mut config = ResilienceConfig::default();
        config.breaker_overrides.insert(
            GET_RESULT.to_string(),
            BreakerSettings {
                max_failures: 1,
                reset_timeout_secs: 60,
                failure_window_secs: 60,
            },
        );
        config.retry.base_delay_ms = 1;
        let guard = CallGuard::new(&config);

        let _ = guard.call(GET_RESULT, 1, || async { Err::<(), _>(status(502)) }).await;

        assert_eq!(guard.breaker(GET_RESULT).state(), State::Open);
        assert_eq!(guard.breaker(CREATE_REQUEST).state(), State::Closed);
    }

    #[test]
    fn classification_follows_configured_statuses() {
        let guard = guard(5, 3);
        assert!(guard.is_transient(&status(429)));
        assert!(guard.is_transient(&PartnerError::NotReady));
        assert!(!guard.is_transient(&status(404)));
        assert!(!guard.is_transient(&PartnerError::Decode("bad json".into())));
    }
}
