//! Worker pool: consumes the main stream and drives orders through the
//! partner.
//!
//! # Pattern: Claim-Read-Process Loop
//!
//! ```text
//! loop {
//!     claim a pending entry idle past the timeout (crashed peer)
//!     otherwise read one new entry (blocking briefly)
//!     process it end-to-end
//!     ack on success; leave pending on infrastructure error
//! }
//! ```
//!
//! Every order mutation is a conditional write. A worker that loses a race
//! acknowledges the entry and moves on, so redelivered or duplicated
//! messages never produce a second partner call for the same claim.

use crate::call_guard::{CREATE_REQUEST, CallGuard, GET_RESULT, GuardedOutcome, ResilienceError};
use crate::metrics::WorkerMetrics;
use chrono::{DateTime, Utc};
use order_gateway_core::config::{GatewayConfig, StreamConfig, WorkerConfig};
use order_gateway_core::environment::Clock;
use order_gateway_core::error::Result;
use order_gateway_core::order::{Order, OrderId, OrderStatus};
use order_gateway_core::order_store::{OrderStore, OrderUpdate};
use order_gateway_core::partner::{PartnerClient, PartnerError, PartnerResult};
use order_gateway_core::stream::{Action, StreamEvent, StreamMessage};
use order_gateway_core::stream_bus::{StreamBus, StreamBusError};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reason recorded when a message outlives its time-to-live.
pub const TTL_EXPIRED: &str = "message ttl expired";

/// What happened to a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The order reached `COMPLETED`
    Completed,
    /// The request was accepted and a `GET_RESULT` was published
    AwaitingResult,
    /// A retryable failure put the order back on the main stream
    Requeued,
    /// A dead-letter entry was written
    DeadLettered,
    /// A result payload was stored on a completed order
    ResultAttached,
    /// Nothing to do (terminal order, lost race, duplicate)
    Skipped,
}

impl Disposition {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AwaitingResult => "awaiting_result",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
            Self::ResultAttached => "result_attached",
            Self::Skipped => "skipped",
        }
    }
}

/// Shared processing context for all workers of a pool.
pub struct Processor {
    store: Arc<dyn OrderStore>,
    bus: Arc<dyn StreamBus>,
    partner: Arc<dyn PartnerClient>,
    guard: Arc<CallGuard>,
    clock: Arc<dyn Clock>,
    streams: StreamConfig,
    worker: WorkerConfig,
    attempt_ceiling: u32,
    abandon_after: std::time::Duration,
}

impl Processor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        bus: Arc<dyn StreamBus>,
        partner: Arc<dyn PartnerClient>,
        guard: Arc<CallGuard>,
        clock: Arc<dyn Clock>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            bus,
            partner,
            guard,
            clock,
            streams: config.stream.clone(),
            worker: config.worker.clone(),
            attempt_ceiling: config.resilience.attempt_ceiling,
            abandon_after: config.stream.pending_timeout().max(config.delivery_budget()),
        }
    }

    /// Create the consumer group on the main stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be created.
    pub async fn ensure_group(&self) -> Result<()> {
        self.bus
            .ensure_group(&self.streams.main_stream, &self.streams.consumer_group)
            .await?;
        Ok(())
    }

    /// Next entry for `consumer`: a stale pending entry first, then a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read.
    pub async fn next_event(&self, consumer: &str) -> std::result::Result<Option<StreamEvent>, StreamBusError> {
        let claimed = self
            .bus
            .claim_stale(
                &self.streams.main_stream,
                &self.streams.consumer_group,
                consumer,
                self.streams.pending_timeout(),
                1,
            )
            .await?;
        if let Some(event) = claimed.into_iter().next() {
            debug!(consumer, event_id = %event.id, deliveries = event.delivery_count, "Claimed stale entry");
            return Ok(Some(event));
        }

        let read = self
            .bus
            .read_group(
                &self.streams.main_stream,
                &self.streams.consumer_group,
                consumer,
                1,
                self.worker.block(),
            )
            .await?;
        Ok(read.into_iter().next())
    }

    /// Fetch and process at most one entry.
    ///
    /// Returns `Ok(None)` when the stream had nothing to deliver.
    ///
    /// # Errors
    ///
    /// Returns an error on store or bus failure; the entry stays pending.
    pub async fn poll_once(&self, consumer: &str) -> Result<Option<Disposition>> {
        match self.next_event(consumer).await? {
            Some(event) => self.process(&event).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process entries until the stream has nothing left to deliver.
    ///
    /// # Errors
    ///
    /// Stops at the first infrastructure error.
    pub async fn drain(&self, consumer: &str) -> Result<Vec<Disposition>> {
        let mut dispositions = Vec::new();
        while let Some(disposition) = self.poll_once(consumer).await? {
            dispositions.push(disposition);
        }
        Ok(dispositions)
    }

    /// Process one entry and acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns an error on store or bus failure. The entry is not
    /// acknowledged and will be redelivered after the pending timeout.
    pub async fn process(&self, event: &StreamEvent) -> Result<Disposition> {
        let started = Instant::now();
        let (action, disposition) = self.handle(event).await?;

        self.bus
            .ack(&self.streams.main_stream, &self.streams.consumer_group, event.id)
            .await?;
        WorkerMetrics::record_message(action, disposition.as_str(), started.elapsed());
        Ok(disposition)
    }

    async fn handle(&self, event: &StreamEvent) -> Result<(&'static str, Disposition)> {
        let message = match event.message() {
            Ok(message) => message,
            Err(e) => {
                self.dead_letter_malformed(event, &e).await?;
                return Ok(("malformed", Disposition::DeadLettered));
            }
        };
        let action = message.action.as_str();

        let Some(order) = self.store.get(message.order_id).await? else {
            warn!(order_id = %message.order_id, event_id = %event.id, "Message for unknown order");
            self.publish_dead_letter(&message, "unknown order", "unknown_order")
                .await?;
            return Ok((action, Disposition::DeadLettered));
        };

        let disposition = match order.status {
            OrderStatus::DeadLettered => {
                debug!(order_id = %order.order_id, "Order already dead-lettered, skipping");
                Disposition::Skipped
            }
            OrderStatus::Completed => self.handle_completed(&order, &message).await?,
            OrderStatus::Failed => {
                // A previous delivery crashed before writing the dead-letter entry.
                let reason = order
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "failed".to_string());
                self.finish_dead_letter(&order, &message, &reason, "recovered")
                    .await?
            }
            _ => self.handle_active(order, &message, event.delivery_count > 1).await?,
        };
        Ok((action, disposition))
    }

    async fn handle_active(
        &self,
        mut order: Order,
        message: &StreamMessage,
        redelivered: bool,
    ) -> Result<Disposition> {
        if order.status == OrderStatus::Created {
            let update = OrderUpdate::new(OrderStatus::Queued, self.clock.now());
            match self
                .store
                .transition(order.order_id, &[OrderStatus::Created], update)
                .await?
            {
                Some(queued) => order = queued,
                None => return Ok(Disposition::Skipped),
            }
        }

        if self.is_expired(message) {
            warn!(order_id = %order.order_id, enqueued_at = %message.enqueued_at, "Message expired");
            return self
                .dead_letter(&order, message, 0, TTL_EXPIRED, "ttl_expired")
                .await;
        }

        if redelivered && message.action == Action::Send && order.status == OrderStatus::InProgress {
            if let Some(correlation_id) = order.correlation_id.clone() {
                debug!(order_id = %order.order_id, "Request already accepted, resuming result poll");
                self.publish_poll(&order, correlation_id).await?;
                return Ok(Disposition::AwaitingResult);
            }
        }

        let remaining = self.attempt_ceiling.saturating_sub(order.attempts);
        if remaining == 0 {
            let reason = ceiling_reason(&order);
            return self
                .dead_letter(&order, message, 0, &reason, "ceiling")
                .await;
        }

        let Some(claimed) = self.claim(order, message, redelivered).await? else {
            debug!(order_id = %message.order_id, action = message.action.as_str(), "Claim lost, skipping");
            return Ok(Disposition::Skipped);
        };

        match message.action {
            Action::Send => self.send(claimed, message, remaining).await,
            Action::GetResult => self.poll_result(claimed, message, remaining).await,
        }
    }

    /// Move the order into the status matching `message.action`.
    async fn claim(&self, order: Order, message: &StreamMessage, redelivered: bool) -> Result<Option<Order>> {
        let now = self.clock.now();
        let order_id = order.order_id;
        let claimed = match (message.action, order.status) {
            (Action::Send, OrderStatus::Queued) => {
                self.store
                    .transition(order_id, &[OrderStatus::Queued], OrderUpdate::new(OrderStatus::Sent, now))
                    .await?
            }
            (Action::Send, OrderStatus::Sent) if redelivered && self.is_abandoned(&order, now) => {
                // The previous owner died mid-call; reclaim through QUEUED.
                let requeued = self
                    .store
                    .transition(order_id, &[OrderStatus::Sent], OrderUpdate::new(OrderStatus::Queued, now))
                    .await?;
                match requeued {
                    Some(_) => {
                        self.store
                            .transition(order_id, &[OrderStatus::Queued], OrderUpdate::new(OrderStatus::Sent, now))
                            .await?
                    }
                    None => None,
                }
            }
            (Action::GetResult, OrderStatus::Queued) => {
                self.store
                    .transition(
                        order_id,
                        &[OrderStatus::Queued],
                        OrderUpdate::new(OrderStatus::InProgress, now),
                    )
                    .await?
            }
            (Action::GetResult, OrderStatus::InProgress) => Some(order),
            _ => None,
        };
        if let Some(order) = &claimed {
            info!(order_id = %order_id, status = %order.status, "Order claimed");
        }
        Ok(claimed)
    }

    async fn send(&self, order: Order, message: &StreamMessage, budget: u32) -> Result<Disposition> {
        let order_id = order.order_id;
        let partner = &self.partner;
        let outcome = self
            .guard
            .call(CREATE_REQUEST, budget, || partner.create_request(order_id))
            .await;

        let receipt = match outcome.result {
            Ok(receipt) => receipt,
            Err(e) => return self.fail(&order, message, outcome.attempts, &e).await,
        };

        let now = self.clock.now();
        if self.worker.await_result {
            let update = OrderUpdate::new(OrderStatus::InProgress, now)
                .add_attempts(outcome.attempts)
                .correlation_id(receipt.correlation_id.clone());
            let Some(updated) = self
                .store
                .transition(order_id, &[OrderStatus::Sent], update)
                .await?
            else {
                warn!(order_id = %order_id, "Order moved during partner call, dropping receipt");
                return Ok(Disposition::Skipped);
            };

            // On failure the SEND stays pending; its redelivery finds the
            // order IN_PROGRESS and only re-publishes the poll.
            self.publish_poll(&updated, receipt.correlation_id).await?;
            info!(order_id = %order_id, attempts = updated.attempts, "Request accepted, awaiting result");
            return Ok(Disposition::AwaitingResult);
        }

        let update = OrderUpdate::new(OrderStatus::Completed, now)
            .add_attempts(outcome.attempts)
            .correlation_id(receipt.correlation_id);
        match self
            .store
            .transition(order_id, &[OrderStatus::Sent], update)
            .await?
        {
            Some(completed) => {
                info!(
                    order_id = %order_id,
                    correlation_id = completed.correlation_id.as_deref().unwrap_or_default(),
                    attempts = completed.attempts,
                    "Order completed"
                );
                Ok(Disposition::Completed)
            }
            None => {
                warn!(order_id = %order_id, "Order moved during partner call, dropping receipt");
                Ok(Disposition::Skipped)
            }
        }
    }

    async fn poll_result(&self, order: Order, message: &StreamMessage, budget: u32) -> Result<Disposition> {
        let order_id = order.order_id;
        let Some(correlation_id) = order
            .correlation_id
            .clone()
            .or_else(|| message.correlation_id.clone())
        else {
            return self
                .dead_letter(&order, message, 0, "missing correlation id", "permanent")
                .await;
        };

        let outcome = self.fetch_result(order_id, &correlation_id, budget).await;
        let payload = match outcome.result {
            Ok(payload) => payload,
            Err(e) => return self.fail(&order, message, outcome.attempts, &e).await,
        };

        let now = self.clock.now();
        let update = OrderUpdate::new(OrderStatus::Completed, now)
            .add_attempts(outcome.attempts)
            .correlation_id(correlation_id);
        let Some(completed) = self
            .store
            .transition(order_id, &[OrderStatus::InProgress], update)
            .await?
        else {
            debug!(order_id = %order_id, "Result already recorded by another worker");
            return Ok(Disposition::Skipped);
        };
        self.store.attach_result(order_id, payload, now).await?;
        info!(order_id = %order_id, attempts = completed.attempts, "Order completed with result");
        Ok(Disposition::Completed)
    }

    /// `GET_RESULT` for an order that completed without a stored payload.
    async fn handle_completed(&self, order: &Order, message: &StreamMessage) -> Result<Disposition> {
        if message.action != Action::GetResult || order.result.is_some() {
            debug!(order_id = %order.order_id, "Order already completed, skipping");
            return Ok(Disposition::Skipped);
        }
        let Some(correlation_id) = order.correlation_id.as_deref() else {
            return Ok(Disposition::Skipped);
        };

        let reason = if self.is_expired(message) {
            TTL_EXPIRED.to_string()
        } else {
            let outcome = self.fetch_result(order.order_id, correlation_id, u32::MAX).await;
            match outcome.result {
                Ok(payload) => {
                    self.store
                        .attach_result(order.order_id, payload, self.clock.now())
                        .await?;
                    info!(order_id = %order.order_id, "Result attached");
                    return Ok(Disposition::ResultAttached);
                }
                Err(e) => e.to_string(),
            }
        };

        warn!(order_id = %order.order_id, error = %reason, "Result fetch failed");
        self.store
            .record_error(order.order_id, reason.clone(), self.clock.now())
            .await?;
        self.publish_dead_letter(message, &reason, "result_fetch")
            .await?;
        Ok(Disposition::DeadLettered)
    }

    async fn fetch_result(
        &self,
        order_id: OrderId,
        correlation_id: &str,
        budget: u32,
    ) -> GuardedOutcome<serde_json::Value> {
        let partner = &self.partner;
        self.guard
            .call(GET_RESULT, budget, || {
                let correlation_id = correlation_id.to_string();
                async move {
                    match partner.get_result(order_id, &correlation_id).await {
                        Ok(PartnerResult::Ready(payload)) => Ok(payload),
                        Ok(PartnerResult::Pending) => Err(PartnerError::NotReady),
                        Err(e) => Err(e),
                    }
                }
            })
            .await
    }

    /// Re-queue a retryable failure, dead-letter anything else.
    async fn fail(
        &self,
        order: &Order,
        message: &StreamMessage,
        attempts: u32,
        error: &ResilienceError,
    ) -> Result<Disposition> {
        let reason = error.to_string();
        let total = order.attempts.saturating_add(attempts);

        if error.is_retryable() && total < self.attempt_ceiling {
            let now = self.clock.now();
            let update = OrderUpdate::new(OrderStatus::Queued, now)
                .add_attempts(attempts)
                .last_error(reason.clone());
            let Some(requeued) = self
                .store
                .transition(order.order_id, &[order.status], update)
                .await?
            else {
                return Ok(Disposition::Skipped);
            };

            let retry = match (message.action, requeued.correlation_id.clone()) {
                (Action::GetResult, Some(correlation_id)) => {
                    StreamMessage::get_result(requeued.order_id, correlation_id, requeued.attempts, now)
                }
                _ => StreamMessage::send(requeued.order_id, requeued.attempts, now),
            };
            self.bus.publish(&self.streams.main_stream, &retry).await?;
            warn!(
                order_id = %order.order_id,
                attempts = requeued.attempts,
                ceiling = self.attempt_ceiling,
                error = %reason,
                "Partner call failed, order re-queued"
            );
            return Ok(Disposition::Requeued);
        }

        let label = match error {
            ResilienceError::CircuitOpen { .. } => "circuit_open",
            ResilienceError::Exhausted { .. } => "exhausted",
            ResilienceError::Permanent(_) => "permanent",
        };
        self.dead_letter(order, message, attempts, &reason, label)
            .await
    }

    /// `current → FAILED`, then write the dead-letter entry.
    async fn dead_letter(
        &self,
        order: &Order,
        message: &StreamMessage,
        attempts: u32,
        reason: &str,
        label: &'static str,
    ) -> Result<Disposition> {
        let update = OrderUpdate::new(OrderStatus::Failed, self.clock.now())
            .add_attempts(attempts)
            .last_error(reason);
        let Some(failed) = self
            .store
            .transition(order.order_id, &[order.status], update)
            .await?
        else {
            debug!(order_id = %order.order_id, "Order moved before dead-lettering, skipping");
            return Ok(Disposition::Skipped);
        };
        self.finish_dead_letter(&failed, message, reason, label)
            .await
    }

    /// Write the dead-letter entry, then `FAILED → DEAD_LETTERED`.
    async fn finish_dead_letter(
        &self,
        order: &Order,
        message: &StreamMessage,
        reason: &str,
        label: &'static str,
    ) -> Result<Disposition> {
        self.publish_dead_letter(message, reason, label).await?;
        let update = OrderUpdate::new(OrderStatus::DeadLettered, self.clock.now());
        if self
            .store
            .transition(order.order_id, &[OrderStatus::Failed], update)
            .await?
            .is_some()
        {
            warn!(
                order_id = %order.order_id,
                attempts = order.attempts,
                reason,
                "Order dead-lettered"
            );
        }
        Ok(Disposition::DeadLettered)
    }

    async fn publish_poll(&self, order: &Order, correlation_id: String) -> Result<()> {
        let poll = StreamMessage::get_result(order.order_id, correlation_id, order.attempts, self.clock.now());
        self.bus.publish(&self.streams.main_stream, &poll).await?;
        Ok(())
    }

    async fn publish_dead_letter(&self, message: &StreamMessage, reason: &str, label: &'static str) -> Result<()> {
        let entry = message.clone().dead_letter(reason, self.clock.now());
        self.bus
            .publish(&self.streams.dead_letter_stream, &entry)
            .await?;
        WorkerMetrics::record_dead_letter(label);
        Ok(())
    }

    async fn dead_letter_malformed(&self, event: &StreamEvent, error: &StreamBusError) -> Result<()> {
        warn!(event_id = %event.id, error = %error, "Undecodable message");
        let entry = serde_json::json!({
            "error": format!("malformed payload: {error}"),
            "failed_at": self.clock.now(),
            "payload": event.payload,
        });
        self.bus
            .append(&self.streams.dead_letter_stream, entry.to_string())
            .await?;
        WorkerMetrics::record_dead_letter("malformed");
        Ok(())
    }

    fn is_expired(&self, message: &StreamMessage) -> bool {
        let Some(ttl) = self.streams.message_ttl() else {
            return false;
        };
        (self.clock.now() - message.enqueued_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }

    /// A `SENT` order whose owner could still be inside its partner call
    /// is never reclaimed.
    fn is_abandoned(&self, order: &Order, now: DateTime<Utc>) -> bool {
        (now - order.updated_at)
            .to_std()
            .is_ok_and(|idle| idle > self.abandon_after)
    }
}

fn ceiling_reason(order: &Order) -> String {
    match &order.last_error {
        Some(error) => format!("attempt ceiling reached: {error}"),
        None => "attempt ceiling reached".to_string(),
    }
}

/// A single consumer of the main stream.
struct Worker {
    name: String,
    processor: Arc<Processor>,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        info!(consumer = %self.name, "Worker started");
        let backoff = self.processor.worker.error_backoff();

        loop {
            // Only the fetch is raced against shutdown; a fetched entry is
            // always processed to completion.
            let next = tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Worker received shutdown signal");
                    break;
                }
                next = self.processor.next_event(&self.name) => next,
            };

            let result = match next {
                Ok(Some(event)) => self.processor.process(&event).await.map(|_| ()),
                Ok(None) => continue,
                Err(e) => Err(e.into()),
            };

            if let Err(e) = result {
                error!(
                    consumer = %self.name,
                    error = %e,
                    "Worker error, retrying in {:?}",
                    backoff
                );
                WorkerMetrics::record_error();
                tokio::time::sleep(backoff).await;
            }
        }

        info!(consumer = %self.name, "Worker stopped");
    }
}

/// Fixed-size pool of workers sharing one consumer group.
pub struct WorkerPool {
    processor: Arc<Processor>,
}

impl WorkerPool {
    /// Create a pool around a shared processor.
    #[must_use]
    pub const fn new(processor: Arc<Processor>) -> Self {
        Self { processor }
    }

    /// Consumer names, `<prefix>-<index>`.
    #[must_use]
    pub fn consumer_names(&self) -> Vec<String> {
        let config = &self.processor.worker;
        (0..config.pool_size)
            .map(|i| format!("{}-{i}", config.consumer_prefix))
            .collect()
    }

    /// Spawn one task per worker.
    ///
    /// Each worker stops after finishing its current entry once `shutdown`
    /// fires.
    #[must_use]
    pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.consumer_names()
            .into_iter()
            .map(|name| {
                let worker = Worker {
                    name,
                    processor: Arc::clone(&self.processor),
                    shutdown: shutdown.subscribe(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}
