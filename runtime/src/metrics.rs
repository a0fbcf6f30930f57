//! Prometheus metrics for the order pipeline.
//!
//! Metric families:
//! - Orders created and queried through the service
//! - Worker message outcomes and processing time
//! - Dead-letter writes by reason
//! - Partner calls, circuit breaker transitions and rejections
//! - Sweep cycles, re-queues and stream trimming
//!
//! # Example
//!
//! ```rust,no_run
//! use order_gateway_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves [`MetricsServer::handle`] empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            // The exporter error type carries no printable detail.
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Service
    describe_counter!(
        "gateway_orders_created_total",
        "Orders accepted by CreateOrder"
    );
    describe_counter!(
        "order_store_conflicts_total",
        "Conditional order writes that found an unexpected status"
    );
    describe_counter!(
        "gateway_order_queries_total",
        "GetOrderResult calls, by outcome"
    );

    // Workers
    describe_counter!(
        "gateway_messages_processed_total",
        "Stream messages handled by workers, by action and disposition"
    );
    describe_histogram!(
        "gateway_message_duration_seconds",
        "Time to process one stream message end-to-end"
    );
    describe_counter!(
        "gateway_worker_errors_total",
        "Infrastructure errors that left a message unacknowledged"
    );
    describe_counter!(
        "gateway_dead_letters_total",
        "Dead-letter entries written, by reason"
    );

    // Partner calls
    describe_counter!(
        "gateway_partner_calls_total",
        "Partner call attempts, by destination and outcome"
    );
    describe_histogram!(
        "gateway_partner_call_duration_seconds",
        "Partner call latency"
    );
    describe_counter!(
        "circuit_breaker_state_changes_total",
        "Circuit breaker transitions, by destination"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Calls rejected by an open circuit"
    );

    // Sweep
    describe_counter!("gateway_sweep_cycles_total", "Sweep cycles run");
    describe_counter!(
        "gateway_sweep_skipped_total",
        "Sweep cycles skipped because the tick fired late"
    );
    describe_counter!(
        "gateway_sweep_requeued_total",
        "Stale orders re-published by the sweep"
    );
    describe_counter!(
        "gateway_sweep_dead_lettered_total",
        "Stale orders dead-lettered by the sweep"
    );
    describe_counter!(
        "gateway_stream_trimmed_total",
        "Stream entries evicted by retention trimming"
    );
    describe_gauge!("gateway_stream_length", "Entries currently in a stream");
}

/// Worker metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a handled message.
    pub fn record_message(action: &'static str, disposition: &'static str, duration: Duration) {
        counter!(
            "gateway_messages_processed_total",
            "action" => action,
            "disposition" => disposition
        )
        .increment(1);
        histogram!("gateway_message_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an infrastructure error.
    pub fn record_error() {
        counter!("gateway_worker_errors_total").increment(1);
    }

    /// Record a dead-letter write.
    pub fn record_dead_letter(reason: &'static str) {
        counter!("gateway_dead_letters_total", "reason" => reason).increment(1);
    }
}

/// Sweep metrics recorder.
pub struct SweepMetrics;

impl SweepMetrics {
    /// Record a completed cycle.
    pub fn record_cycle(requeued: u64, dead_lettered: u64, trimmed: u64) {
        counter!("gateway_sweep_cycles_total").increment(1);
        counter!("gateway_sweep_requeued_total").increment(requeued);
        counter!("gateway_sweep_dead_lettered_total").increment(dead_lettered);
        counter!("gateway_stream_trimmed_total").increment(trimmed);
    }

    /// Record a skipped cycle.
    pub fn record_skip() {
        counter!("gateway_sweep_skipped_total").increment(1);
    }

    /// Record a stream length observation.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_stream_length(stream: &str, len: u64) {
        gauge!("gateway_stream_length", "stream" => stream.to_string()).set(len as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_start() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        // The handle may stay empty if another test installed a recorder first.
        assert!(server.start().is_ok());
    }

    #[test]
    fn test_recorders_without_installed_exporter() {
        // Recording without a recorder is a no-op and must not panic.
        WorkerMetrics::record_message("send", "completed", Duration::from_millis(5));
        WorkerMetrics::record_dead_letter("exhausted");
        SweepMetrics::record_cycle(1, 0, 3);
        SweepMetrics::record_skip();
        SweepMetrics::record_stream_length("orders:main", 10);
    }
}
