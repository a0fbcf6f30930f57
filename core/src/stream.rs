//! Stream entry identification and the messages carried on the streams.
//!
//! Ids follow the `<millis>-<seq>` format used by Redis Streams so that both
//! bus implementations agree on ordering and on age-based retention.

use crate::order::OrderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for [`EventId`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream entry id: {0}")]
pub struct ParseEventIdError(String);

/// Id of a stream entry, unique and monotonic within one stream.
///
/// # Examples
///
/// ```
/// use order_gateway_core::stream::EventId;
///
/// let id: EventId = "1700000000000-3".parse().unwrap();
/// assert_eq!(id.millis(), 1_700_000_000_000);
/// assert_eq!(id.to_string(), "1700000000000-3");
/// assert!(EventId::new(1, 0) < EventId::new(1, 1));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    millis: u64,
    seq: u64,
}

impl EventId {
    /// Create an id from its parts.
    #[must_use]
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Milliseconds since the Unix epoch when the entry was appended.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.millis
    }

    /// Sequence number within the millisecond.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// The smallest id that is strictly greater than `self`.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self {
            millis: self.millis,
            seq: self.seq + 1,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s.split_once('-').unwrap_or((s, "0"));
        let millis = millis.parse().map_err(|_| ParseEventIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| ParseEventIdError(s.to_string()))?;
        Ok(Self { millis, seq })
    }
}

/// What a worker should do with an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Submit the order to the partner
    Send,
    /// Fetch the partner's result for an accepted order
    GetResult,
}

impl Action {
    /// Name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::GetResult => "get_result",
        }
    }
}

/// Work item carried on the main stream; with `error`/`failed_at` set it is
/// a dead-letter entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Requested action
    pub action: Action,
    /// Target order
    pub order_id: OrderId,
    /// Partner correlation id, for `GET_RESULT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Order attempts at the time of publishing
    pub attempt: u32,
    /// When the message was first enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Dead-letter reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the message was dead-lettered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl StreamMessage {
    /// A `SEND` work item.
    #[must_use]
    pub const fn send(order_id: OrderId, attempt: u32, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            action: Action::Send,
            order_id,
            correlation_id: None,
            attempt,
            enqueued_at,
            error: None,
            failed_at: None,
        }
    }

    /// A `GET_RESULT` work item.
    #[must_use]
    pub fn get_result(
        order_id: OrderId,
        correlation_id: impl Into<String>,
        attempt: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action: Action::GetResult,
            order_id,
            correlation_id: Some(correlation_id.into()),
            attempt,
            enqueued_at,
            error: None,
            failed_at: None,
        }
    }

    /// Turn this work item into a dead-letter entry.
    #[must_use]
    pub fn dead_letter(mut self, error: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        self.error = Some(error.into());
        self.failed_at = Some(failed_at);
        self
    }

    /// Encode for storage on a stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamBusError::Serialization`](crate::stream_bus::StreamBusError::Serialization)
    /// if encoding fails.
    pub fn to_payload(&self) -> Result<String, crate::stream_bus::StreamBusError> {
        serde_json::to_string(self)
            .map_err(|e| crate::stream_bus::StreamBusError::Serialization(e.to_string()))
    }

    /// Decode from a stream payload.
    ///
    /// # Errors
    ///
    /// Returns [`StreamBusError::Serialization`](crate::stream_bus::StreamBusError::Serialization)
    /// if the payload is not a valid message.
    pub fn from_payload(payload: &str) -> Result<Self, crate::stream_bus::StreamBusError> {
        serde_json::from_str(payload)
            .map_err(|e| crate::stream_bus::StreamBusError::Serialization(e.to_string()))
    }
}

/// An entry read from a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    /// Stream the entry was read from
    pub stream: String,
    /// Entry id
    pub id: EventId,
    /// Encoded [`StreamMessage`]
    pub payload: String,
    /// Number of times the entry has been delivered to a consumer of the
    /// group (1 on first delivery, 0 when read outside a group)
    pub delivery_count: u32,
}

impl StreamEvent {
    /// Decode the payload.
    ///
    /// # Errors
    ///
    /// Returns [`StreamBusError::Serialization`](crate::stream_bus::StreamBusError::Serialization)
    /// for a malformed payload.
    pub fn message(&self) -> Result<StreamMessage, crate::stream_bus::StreamBusError> {
        StreamMessage::from_payload(&self.payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_id_parses_bare_millis() {
        let id: EventId = "1234".parse().unwrap();
        assert_eq!(id, EventId::new(1234, 0));
    }

    #[test]
    fn event_id_rejects_garbage() {
        assert!("abc-1".parse::<EventId>().is_err());
        assert!("1-x".parse::<EventId>().is_err());
        assert!("".parse::<EventId>().is_err());
    }

    #[test]
    fn event_ids_order_by_millis_then_seq() {
        let mut ids = vec![EventId::new(5, 0), EventId::new(2, 9), EventId::new(5, 1)];
        ids.sort();
        assert_eq!(ids, vec![EventId::new(2, 9), EventId::new(5, 0), EventId::new(5, 1)]);
        assert_eq!(EventId::new(5, 1).next(), EventId::new(5, 2));
    }

    #[test]
    fn send_message_omits_dead_letter_fields() {
        let msg = StreamMessage::send(OrderId::new(42).unwrap(), 0, Utc::now());
        let payload = msg.to_payload().unwrap();
        assert!(payload.contains("\"action\":\"SEND\""));
        assert!(payload.contains("\"order_id\":42"));
        assert!(!payload.contains("error"));
        assert_eq!(StreamMessage::from_payload(&payload).unwrap(), msg);
    }

    #[test]
    fn dead_letter_entry_carries_reason() {
        let now = Utc::now();
        let msg = StreamMessage::get_result(OrderId::new(7).unwrap(), "corr-1", 3, now)
            .dead_letter("attempts exhausted", now);
        assert_eq!(msg.action, Action::GetResult);
        assert_eq!(msg.error.as_deref(), Some("attempts exhausted"));
        assert_eq!(msg.failed_at, Some(now));
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        let event = StreamEvent {
            stream: "orders".into(),
            id: EventId::new(1, 0),
            payload: "{\"action\":\"FLY\"}".into(),
            delivery_count: 1,
        };
        assert!(event.message().is_err());
    }
}
