//! Circuit breaker for a single partner destination.
//!
//! A circuit breaker monitors calls and "opens" (stops allowing requests) when
//! consecutive failures reach a threshold, so a failing partner is not
//! hammered while it recovers.
//!
//! # States
//!
//! - **Closed**: Requests pass through. Consecutive failures are counted; a
//!   failure older than the rolling window no longer counts.
//! - **Open**: Requests fail immediately for the reset timeout.
//! - **HalfOpen**: After the timeout, exactly one trial request is let
//!   through. Success closes the circuit and resets counters; failure opens
//!   it again and restarts the timeout.
//!
//! # Example
//!
//! ```rust
//! use order_gateway_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .timeout(Duration::from_secs(60))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("partner.create_request", config);
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use order_gateway_core::config::BreakerSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Duration to stay Open before allowing a trial
    pub timeout: Duration,
    /// A failure is only consecutive with the previous one if it happened
    /// within this window
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(BreakerSettings::default())
    }
}

impl From<BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.max_failures,
            timeout: settings.reset_timeout(),
            failure_window: settings.failure_window(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder starting from the defaults.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Circuit opens after this many consecutive failures.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// How long to stay Open before trying `HalfOpen`.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    /// Rolling window for consecutive failures.
    #[must_use]
    pub const fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window = window;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, one trial request decides
    HalfOpen,
}

impl State {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one destination.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

/// Permission to run one call, returned by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`]. A
/// permit dropped without a report (the call was cancelled) releases the
/// half-open trial slot and re-opens the circuit.
#[derive(Debug)]
pub struct Permit {
    breaker: CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl Permit {
    /// The call succeeded (or the destination answered).
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success();
    }

    /// The call failed in a way that counts against the destination.
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure();
    }

    /// Report `result`, counting an error as a failure only when `counts`
    /// says so.
    ///
    /// Errors that do not count (for example a 4xx answer) still prove the
    /// destination is reachable and are recorded as a success.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Inner` carrying the operation's error.
    pub fn settle<T, E>(
        self,
        result: Result<T, E>,
        counts: impl FnOnce(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>> {
        match result {
            Ok(value) => {
                self.success();
                Ok(value)
            }
            Err(err) => {
                if counts(&err) {
                    self.failure();
                } else {
                    self.success();
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.reported && self.trial {
            let mut state = self.breaker.lock();
            state.trial_in_flight = false;
            if state.state == State::HalfOpen {
                self.breaker.transition(&mut state, State::Open);
                state.opened_at = Some(Instant::now());
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker for the named destination.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: State::Closed,
                failure_count: 0,
                last_failure_time: None,
                opened_at: None,
                trial_in_flight: false,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Destination name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    ///
    /// An Open circuit whose timeout has elapsed still reports `Open` until a
    /// call arrives to take the trial.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        // State updates never panic mid-way; a poisoned lock still holds
        // consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to run one call.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open, or if it
    /// is half-open and the single trial is already in flight.
    pub fn try_acquire(&self) -> Result<Permit, CircuitBreakerError<std::convert::Infallible>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();

        let trial = match state.state {
            State::Closed => false,
            State::HalfOpen => {
                if state.trial_in_flight {
                    drop(state);
                    return Err(self.reject());
                }
                state.trial_in_flight = true;
                true
            }
            State::Open => {
                let expired = state
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.timeout);
                if !expired {
                    drop(state);
                    return Err(self.reject());
                }
                self.transition(&mut state, State::HalfOpen);
                state.trial_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breaker: self.clone(),
            trial,
            reported: false,
        })
    }

    fn reject<E>(&self) -> CircuitBreakerError<E> {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("circuit_breaker_rejections_total", "destination" => self.name.to_string())
            .increment(1);
        tracing::warn!(destination = %self.name, "Circuit breaker is OPEN, rejecting request");
        CircuitBreakerError::Open
    }

    /// Call an operation through the circuit breaker; every error counts as
    /// a failure.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Call an operation, counting only errors for which `counts` is true.
    ///
    /// Errors that do not count (for example a 4xx answer) still prove the
    /// destination is reachable and are recorded as a success.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        counts: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let permit = self.try_acquire().map_err(|_| CircuitBreakerError::Open)?;
        permit.settle(operation().await, counts)
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: State) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        metrics::counter!(
            "circuit_breaker_state_changes_total",
            "destination" => self.name.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            State::Open => tracing::warn!(
                destination = %self.name,
                from = from.as_str(),
                failures = state.failure_count,
                "Circuit breaker transitioning to OPEN"
            ),
            State::HalfOpen | State::Closed => tracing::info!(
                destination = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state change"
            ),
        }
    }

    fn on_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.failure_count = 0;
        state.last_failure_time = None;
        if state.state == State::HalfOpen {
            state.trial_in_flight = false;
            state.opened_at = None;
            self.transition(&mut state, State::Closed);
        }
    }

    fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.lock();

        match state.state {
            State::Closed => {
                let within_window = state
                    .last_failure_time
                    .is_some_and(|last| now.duration_since(last) <= self.config.failure_window);
                state.failure_count = if within_window { state.failure_count + 1 } else { 1 };
                state.last_failure_time = Some(now);
                if state.failure_count >= self.config.failure_threshold {
                    state.opened_at = Some(now);
                    self.transition(&mut state, State::Open);
                }
            }
            State::HalfOpen => {
                state.trial_in_flight = false;
                state.failure_count = 1;
                state.last_failure_time = Some(now);
                state.opened_at = Some(now);
                self.transition(&mut state, State::Open);
            }
            State::Open => {
                // Call admitted before the circuit opened; keeps the circuit open.
                state.last_failure_time = Some(now);
            }
        }
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut state = self.lock();
        tracing::info!(destination = %self.name, "Circuit breaker manually reset to CLOSED");
        self.transition(&mut state, State::Closed);
        state.failure_count = 0;
        state.last_failure_time = None;
        state.opened_at = None;
        state.trial_in_flight = false;
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of calls recorded as successes
    pub total_successes: u64,
    /// Total number of calls recorded as failures
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}
