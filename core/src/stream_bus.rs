//! Stream bus abstraction: durable, trimmed, append-only logs with consumer groups.
//!
//! Two logical streams are used by the pipeline:
//!
//! - **main**: `SEND` / `GET_RESULT` work items
//! - **dead-letter**: work items that exhausted their attempts or failed permanently
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: an entry read through a consumer group stays in the
//!   group's pending-entry list until acknowledged. If the consumer dies, the
//!   entry is handed to another consumer by [`StreamBus::claim_stale`] once it
//!   has been idle longer than the pending timeout.
//! - **Single owner**: within a group, an entry is owned by exactly one
//!   consumer at a time.
//! - **Ordered per stream**: ids increase monotonically; there is no ordering
//!   guarantee across consumers.
//!
//! # Retention
//!
//! Streams are bounded approximately: by length (`max_len`) on every append,
//! and by age (`retention_hours`) on [`StreamBus::trim`]. Implementations may
//! keep slightly more entries than the configured bound.
//!
//! # Implementations
//!
//! - `RedisStreamBus` (in `order-gateway-redis`): Redis Streams
//! - `InMemoryStreamBus` (in `order-gateway-testing`): deterministic tests

use crate::stream::{EventId, StreamEvent, StreamMessage};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during stream bus operations.
#[derive(Error, Debug, Clone)]
pub enum StreamBusError {
    /// Failed to connect to the backing store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to append to a stream
    #[error("Publish failed for stream '{stream}': {reason}")]
    PublishFailed {
        /// The stream that failed
        stream: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to read from a stream
    #[error("Read failed for stream '{stream}': {reason}")]
    ReadFailed {
        /// The stream that failed
        stream: String,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group missing or could not be created
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Trait for stream bus implementations.
///
/// Stream and group names are passed per call; the retention limits are
/// fixed at construction.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the bus can be shared as
/// `Arc<dyn StreamBus>`. Implementations copy borrowed arguments before
/// moving into the returned future.
pub trait StreamBus: Send + Sync {
    /// Create the consumer group if it does not exist.
    ///
    /// New groups start from the beginning of the stream. Idempotent.
    ///
    /// # Errors
    ///
    /// - `ConsumerGroupError`: the group could not be created
    fn ensure_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamBusError>> + Send + '_>>;

    /// Append an encoded payload, applying approximate length trimming.
    ///
    /// # Errors
    ///
    /// - `PublishFailed`: the append failed
    fn append(
        &self,
        stream: &str,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<EventId, StreamBusError>> + Send + '_>>;

    /// Encode and append a message.
    ///
    /// # Errors
    ///
    /// - `Serialization`: the message could not be encoded
    /// - `PublishFailed`: the append failed
    fn publish(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> Pin<Box<dyn Future<Output = Result<EventId, StreamBusError>> + Send + '_>> {
        match message.to_payload() {
            Ok(payload) => self.append(stream, payload),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    /// Deliver up to `count` entries never delivered to `group` before.
    ///
    /// Delivered entries enter the group's pending-entry list owned by
    /// `consumer`. Waits up to `block` when nothing is available and returns
    /// an empty batch on timeout.
    ///
    /// # Errors
    ///
    /// - `ConsumerGroupError`: the group does not exist
    /// - `ReadFailed`: the read failed
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>>;

    /// Take over pending entries idle for at least `min_idle`.
    ///
    /// Claimed entries are re-owned by `consumer` and their delivery count is
    /// incremented. Entries trimmed away while pending are dropped from the
    /// pending list.
    ///
    /// # Errors
    ///
    /// - `ConsumerGroupError`: the group does not exist
    /// - `ReadFailed`: the claim failed
    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>>;

    /// Acknowledge an entry, removing it from the pending-entry list.
    ///
    /// Returns `false` if the entry was not pending.
    ///
    /// # Errors
    ///
    /// - `TransportError`: the acknowledgment could not be sent
    fn ack(
        &self,
        stream: &str,
        group: &str,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StreamBusError>> + Send + '_>>;

    /// Number of entries currently in the stream.
    ///
    /// # Errors
    ///
    /// - `ReadFailed`: the query failed
    fn len(&self, stream: &str) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>>;

    /// Number of entries delivered to `group` but not yet acknowledged.
    ///
    /// # Errors
    ///
    /// - `ReadFailed`: the query failed
    fn pending_count(
        &self,
        stream: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>>;

    /// The oldest `limit` entries, without touching any group.
    ///
    /// # Errors
    ///
    /// - `ReadFailed`: the query failed
    fn range(
        &self,
        stream: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>>;

    /// Evict entries older than the retention window.
    ///
    /// Returns the number of entries evicted (may be approximate).
    ///
    /// # Errors
    ///
    /// - `TransportError`: the trim failed
    fn trim(&self, stream: &str) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_failed_error_display() {
        let error = StreamBusError::PublishFailed {
            stream: "orders:main".to_string(),
            reason: "connection reset".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("orders:main"));
        assert!(display.contains("connection reset"));
    }
}
