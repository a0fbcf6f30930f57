//! # Order Gateway Runtime
//!
//! The moving parts of the order pipeline, built on the traits in
//! `order-gateway-core`.
//!
//! ## Core Components
//!
//! - **`OrderService`**: `CreateOrder` / `GetOrderResult` surface
//! - **`WorkerPool`**: consumes the main stream and calls the partner
//! - **`CallGuard`**: per-destination circuit breakers plus bounded retry
//! - **`SweepScheduler`**: re-queues or dead-letters orders stuck in flight
//! - **`MetricsServer`**: Prometheus exporter
//!
//! ## Example
//!
//! ```ignore
//! use order_gateway_runtime::{CallGuard, OrderService, Processor, WorkerPool};
//!
//! let guard = Arc::new(CallGuard::new(&config.resilience));
//! let processor = Arc::new(Processor::new(store.clone(), bus.clone(), partner, guard, clock.clone(), &config));
//! processor.ensure_group().await?;
//! let workers = WorkerPool::new(processor).spawn(&shutdown_tx);
//!
//! let service = OrderService::new(store, bus, clock, &config.stream);
//! let response = service.create_order(42).await?;
//! ```

/// Retry with jittered backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Breaker registry and retry for partner calls
pub mod call_guard;

/// Prometheus metrics for observability
pub mod metrics;

/// Stream consumers
pub mod worker;

/// Stale order recovery
pub mod sweep;

/// Caller-facing order service
pub mod service;

pub use call_guard::{CallGuard, ResilienceError};
pub use circuit_breaker::CircuitBreaker;
pub use metrics::MetricsServer;
pub use service::{OrderResponse, OrderService};
pub use sweep::{SweepReport, SweepScheduler};
pub use worker::{Disposition, Processor, WorkerPool};
