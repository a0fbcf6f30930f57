//! Order records and the order lifecycle state machine.
//!
//! An [`Order`] moves through a fixed set of [`OrderStatus`] values. The
//! allowed edges are encoded in [`OrderStatus::can_transition_to`] and every
//! store implementation checks them before applying a conditional write, so an
//! order can never move backward.
//!
//! ```text
//! CREATED ──► QUEUED ──► SENT ──────────► COMPLETED
//!               ▲  │       │                 ▲
//!               │  │       ▼                 │
//!               │  └──► IN_PROGRESS ─────────┘
//!               │          │
//!               └──────────┤ (retryable, attempts remain)
//!                          ▼
//!                        FAILED ──► DEAD_LETTERED
//! ```
//!
//! `QUEUED`, `SENT` and `IN_PROGRESS` may also move straight to
//! `DEAD_LETTERED` when the sweep gives up on a stuck order, and `QUEUED`
//! may move to `FAILED` when a work item expires or arrives after the
//! attempt ceiling was reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when an order id fails validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid order id {0}: must be a positive integer")]
pub struct InvalidOrderId(pub i64);

/// Caller-supplied order identifier.
///
/// Always a positive 64-bit integer. Construct with [`OrderId::new`] for
/// external input.
///
/// # Examples
///
/// ```
/// use order_gateway_core::order::OrderId;
///
/// let id = OrderId::new(42).unwrap();
/// assert_eq!(id.get(), 42);
/// assert!(OrderId::new(0).is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct OrderId(i64);

impl OrderId {
    /// Validate and wrap a raw order id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOrderId`] when `raw` is zero or negative.
    pub const fn new(raw: i64) -> Result<Self, InvalidOrderId> {
        if raw <= 0 {
            return Err(InvalidOrderId(raw));
        }
        Ok(Self(raw))
    }

    /// The raw integer value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for OrderId {
    type Error = InvalidOrderId;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OrderId> for i64 {
    fn from(id: OrderId) -> Self {
        id.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for [`OrderStatus`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown order status: {0}")]
pub struct ParseStatusError(String);

/// Lifecycle status of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Record exists, nothing published yet
    Created,
    /// A work item is on the main stream
    Queued,
    /// A worker claimed the order and is calling the partner
    Sent,
    /// The partner accepted the request; waiting for or fetching the result
    InProgress,
    /// Terminal success
    Completed,
    /// Gave up; a dead-letter entry is being written
    Failed,
    /// Terminal failure, dead-letter entry written
    DeadLettered,
}

impl OrderStatus {
    /// Statuses an order can be stuck in while work is outstanding.
    pub const IN_FLIGHT: [Self; 3] = [Self::Queued, Self::Sent, Self::InProgress];

    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Status string reported to external callers.
    ///
    /// `FAILED` and `DEAD_LETTERED` are both reported as `failed`.
    #[must_use]
    pub const fn external_str(self) -> &'static str {
        match self {
            Self::Failed | Self::DeadLettered => "failed",
            other => other.as_str(),
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }

    /// Whether the order is waiting on the pipeline.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Sent | Self::InProgress)
    }

    /// Whether `self → next` is an edge of the lifecycle.
    ///
    /// `QUEUED → QUEUED` is allowed so that the sweep can refresh the
    /// timestamp of a stale order while re-publishing it.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use OrderStatus::{Completed, Created, DeadLettered, Failed, InProgress, Queued, Sent};
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Queued | Sent | InProgress | Failed | DeadLettered)
                | (Sent, InProgress | Completed | Queued | Failed | DeadLettered)
                | (InProgress, Completed | Queued | Failed | DeadLettered)
                | (Failed, DeadLettered)
        )
    }

    /// Position in the lifecycle, used to check monotonic progress.
    ///
    /// `QUEUED` re-entries from `SENT`/`IN_PROGRESS` stay inside the in-flight
    /// band `[1, 3]`, so any sequence of allowed transitions never drops below
    /// the band it started in.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Queued => 1,
            Self::Sent => 2,
            Self::InProgress => 3,
            Self::Completed | Self::Failed => 4,
            Self::DeadLettered => 5,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Canonical persisted state of an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Caller-supplied id
    pub order_id: OrderId,
    /// Partner-assigned id, known once the partner accepted the request
    pub correlation_id: Option<String>,
    /// Current lifecycle status
    pub status: OrderStatus,
    /// Partner call attempts charged to this order
    pub attempts: u32,
    /// Last failure diagnostic
    pub last_error: Option<String>,
    /// Partner result payload, if fetched
    pub result: Option<serde_json::Value>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A fresh record in `CREATED`.
    #[must_use]
    pub const fn new(order_id: OrderId, at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            correlation_id: None,
            status: OrderStatus::Created,
            attempts: 0,
            last_error: None,
            result: None,
            created_at: at,
            updated_at: at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [OrderStatus; 7] = [
        OrderStatus::Created,
        OrderStatus::Queued,
        OrderStatus::Sent,
        OrderStatus::InProgress,
        OrderStatus::Completed,
        OrderStatus::Failed,
        OrderStatus::DeadLettered,
    ];

    #[test]
    fn order_id_rejects_non_positive() {
        assert_eq!(OrderId::new(0), Err(InvalidOrderId(0)));
        assert_eq!(OrderId::new(-7), Err(InvalidOrderId(-7)));
        assert_eq!(OrderId::new(1).unwrap().get(), 1);
    }

    #[test]
    fn order_id_deserialization_validates() {
        let parsed: Result<OrderId, _> = serde_json::from_str("-1");
        assert!(parsed.is_err());
        let parsed: OrderId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed.get(), 42);
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn failed_and_dead_lettered_report_as_failed() {
        assert_eq!(OrderStatus::Failed.external_str(), "failed");
        assert_eq!(OrderStatus::DeadLettered.external_str(), "failed");
        assert_eq!(OrderStatus::InProgress.external_str(), "in_progress");
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in [OrderStatus::Completed, OrderStatus::DeadLettered] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn failed_only_goes_to_dead_lettered() {
        for to in ALL {
            let allowed = OrderStatus::Failed.can_transition_to(to);
            assert_eq!(allowed, to == OrderStatus::DeadLettered);
        }
    }

    #[test]
    fn nothing_returns_to_created() {
        for from in ALL {
            assert!(!from.can_transition_to(OrderStatus::Created));
        }
    }

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        (0..ALL.len()).prop_map(|i| ALL[i])
    }

    proptest! {
        #[test]
        fn allowed_walks_never_move_backward(steps in proptest::collection::vec(any_status(), 0..40)) {
            let mut current = OrderStatus::Created;
            for next in steps {
                if !current.can_transition_to(next) {
                    continue;
                }
                // Only the in-flight loop may lower the rank.
                if next.rank() < current.rank() {
                    prop_assert_eq!(next, OrderStatus::Queued);
                    prop_assert!(current.is_in_flight());
                }
                prop_assert_ne!(next, OrderStatus::Created);
                current = next;
            }
        }
    }
}
