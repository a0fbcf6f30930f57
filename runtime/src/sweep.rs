//! Periodic recovery of orders stuck in flight.
//!
//! Each cycle scans for in-flight orders untouched for longer than
//! `stale_after`. Orders below the attempt ceiling are moved back to
//! `QUEUED` and re-published. Orders at the ceiling are dead-lettered the
//! same way a worker does it: `FAILED` first, then the dead-letter entry,
//! then `DEAD_LETTERED`. A `FAILED` order is still scanned, so a
//! dead-letter publish that failed is retried on the next cycle. Every move
//! is a conditional write, so a worker that advanced the order in the
//! meantime wins.
//!
//! A tick that fires later than `tolerance` after its schedule is skipped
//! rather than run, so a stalled process does not wake up into a burst of
//! duplicate re-queues.

use crate::metrics::SweepMetrics;
use order_gateway_core::config::{GatewayConfig, StreamConfig, SweepConfig};
use order_gateway_core::environment::Clock;
use order_gateway_core::error::{GatewayError, Result};
use order_gateway_core::order::{Order, OrderStatus};
use order_gateway_core::order_store::{OrderStore, OrderUpdate};
use order_gateway_core::stream::StreamMessage;
use order_gateway_core::stream_bus::StreamBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Statuses the sweep scans: in flight, or failed without a dead-letter entry.
const SWEPT: [OrderStatus; 4] = [
    OrderStatus::Queued,
    OrderStatus::Sent,
    OrderStatus::InProgress,
    OrderStatus::Failed,
];

/// Counts from one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale orders found
    pub scanned: usize,
    /// Orders re-published to the main stream
    pub requeued: u64,
    /// Orders dead-lettered at the ceiling
    pub dead_lettered: u64,
    /// Stream entries evicted by retention trimming
    pub trimmed: u64,
}

/// Sweep scheduler.
pub struct SweepScheduler {
    store: Arc<dyn OrderStore>,
    bus: Arc<dyn StreamBus>,
    clock: Arc<dyn Clock>,
    streams: StreamConfig,
    sweep: SweepConfig,
    attempt_ceiling: u32,
}

impl SweepScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        bus: Arc<dyn StreamBus>,
        clock: Arc<dyn Clock>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            streams: config.stream.clone(),
            sweep: config.sweep.clone(),
            attempt_ceiling: config.resilience.attempt_ceiling,
        }
    }

    /// Whether a tick that fired `lateness` after its schedule must be skipped.
    #[must_use]
    pub fn should_skip(&self, lateness: Duration) -> bool {
        lateness > self.sweep.tolerance()
    }

    /// Run one sweep cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale scan fails. Failures on individual
    /// orders are logged and left for the next cycle.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let stale_after = chrono::Duration::from_std(self.sweep.stale_after())
            .map_err(|e| GatewayError::Validation(format!("stale_after out of range: {e}")))?;
        let cutoff = now - stale_after;

        let stale = self
            .store
            .list_stale(&SWEPT, cutoff, self.sweep.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for order in stale {
            let order_id = order.order_id;
            let result = if order.status == OrderStatus::Failed || order.attempts >= self.attempt_ceiling {
                self.dead_letter(order).await.map(|done| {
                    if done {
                        report.dead_lettered += 1;
                    }
                })
            } else {
                self.requeue(order).await.map(|done| {
                    if done {
                        report.requeued += 1;
                    }
                })
            };
            if let Err(e) = result {
                error!(order_id = %order_id, error = %e, "Sweep failed for order");
            }
        }

        report.trimmed = self.trim_streams().await;
        SweepMetrics::record_cycle(report.requeued, report.dead_lettered, report.trimmed);
        Ok(report)
    }

    async fn requeue(&self, order: Order) -> Result<bool> {
        let now = self.clock.now();
        let Some(queued) = self
            .store
            .transition(
                order.order_id,
                &[order.status],
                OrderUpdate::new(OrderStatus::Queued, now),
            )
            .await?
        else {
            return Ok(false);
        };

        let message = work_item(&queued, now);
        self.bus.publish(&self.streams.main_stream, &message).await?;
        info!(
            order_id = %order.order_id,
            from = %order.status,
            action = message.action.as_str(),
            attempts = order.attempts,
            "Stale order re-queued"
        );
        Ok(true)
    }

    async fn dead_letter(&self, order: Order) -> Result<bool> {
        let now = self.clock.now();
        let (failed, reason) = if order.status == OrderStatus::Failed {
            let reason = order
                .last_error
                .clone()
                .unwrap_or_else(|| "failed".to_string());
            (order, reason)
        } else {
            let reason = match &order.last_error {
                Some(error) => format!("attempt ceiling reached: {error}"),
                None => "attempt ceiling reached".to_string(),
            };
            let update = OrderUpdate::new(OrderStatus::Failed, now).last_error(reason.clone());
            let Some(failed) = self
                .store
                .transition(order.order_id, &[order.status], update)
                .await?
            else {
                return Ok(false);
            };
            (failed, reason)
        };

        // The order leaves FAILED only once its entry is on the stream.
        let entry = work_item(&failed, now).dead_letter(reason.clone(), now);
        self.bus
            .publish(&self.streams.dead_letter_stream, &entry)
            .await?;

        let done = self
            .store
            .transition(
                failed.order_id,
                &[OrderStatus::Failed],
                OrderUpdate::new(OrderStatus::DeadLettered, now),
            )
            .await?
            .is_some();
        if done {
            warn!(
                order_id = %failed.order_id,
                attempts = failed.attempts,
                reason = %reason,
                "Stale order dead-lettered"
            );
        }
        Ok(done)
    }

    async fn trim_streams(&self) -> u64 {
        let mut trimmed = 0;
        for stream in [&self.streams.main_stream, &self.streams.dead_letter_stream] {
            match self.bus.trim(stream).await {
                Ok(evicted) => trimmed += evicted,
                Err(e) => warn!(stream = %stream, error = %e, "Stream trim failed"),
            }
            if let Ok(len) = self.bus.len(stream).await {
                SweepMetrics::record_stream_length(stream, len);
            }
        }
        trimmed
    }

    /// Spawn the periodic sweep.
    ///
    /// The first cycle runs one interval after spawning.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.sweep.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "Sweep scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Sweep scheduler received shutdown signal");
                    break;
                }
                scheduled = ticker.tick() => {
                    let lateness = Instant::now().saturating_duration_since(scheduled);
                    if self.should_skip(lateness) {
                        warn!(lateness_ms = lateness.as_millis(), "Sweep fired late, skipping cycle");
                        SweepMetrics::record_skip();
                        continue;
                    }
                    match self.sweep_once().await {
                        Ok(report) => debug!(?report, "Sweep cycle finished"),
                        Err(e) => error!(error = %e, "Sweep cycle failed"),
                    }
                }
            }
        }

        info!("Sweep scheduler stopped");
    }
}

/// The message that resumes `order`: a result poll once the partner
/// assigned a correlation id, a fresh request otherwise.
fn work_item(order: &Order, at: chrono::DateTime<chrono::Utc>) -> StreamMessage {
    match &order.correlation_id {
        Some(correlation_id) => {
            StreamMessage::get_result(order.order_id, correlation_id.clone(), order.attempts, at)
        }
        None => StreamMessage::send(order.order_id, order.attempts, at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_gateway_core::environment::SystemClock;
    use order_gateway_testing::{InMemoryOrderStore, InMemoryStreamBus};

    fn scheduler(tolerance_secs: u64) -> SweepScheduler {
        let mut config = GatewayConfig::default();
        config.sweep.tolerance_secs = tolerance_secs;
        SweepScheduler::new(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryStreamBus::new(config.stream.clone())),
            Arc::new(SystemClock),
            &config,
        )
    }

    #[test]
    fn late_ticks_past_tolerance_are_skipped() {
        let sweep = scheduler(10);
        assert!(!sweep.should_skip(Duration::from_secs(0)));
        assert!(!sweep.should_skip(Duration::from_secs(10)));
        assert!(sweep.should_skip(Duration::from_secs(11)));
    }

    #[tokio::test]
    async fn empty_store_reports_nothing() {
        let report = scheduler(10).sweep_once().await;
        assert!(matches!(report, Ok(r) if r == SweepReport::default()));
    }
}
