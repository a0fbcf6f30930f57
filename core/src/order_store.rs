//! Order store trait: the single owner of order state.
//!
//! Every mutation is a conditional write. The caller names the set of
//! statuses it expects the order to be in; the write is applied only if the
//! stored status is one of them. A writer that lost the race gets `Ok(None)`
//! back and is expected to treat that as "someone else already advanced the
//! order".
//!
//! # Implementations
//!
//! - `PostgresOrderStore` (in `order-gateway-postgres`): production storage
//! - `InMemoryOrderStore` (in `order-gateway-testing`): fast, deterministic tests

use crate::order::{Order, OrderId, OrderStatus};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during order store operations.
#[derive(Error, Debug, Clone)]
pub enum OrderStoreError {
    /// The requested edge is not part of the order lifecycle.
    ///
    /// Raised before touching storage, so a buggy caller can never write a
    /// backward transition.
    #[error("Invalid transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        /// The order being updated
        order_id: OrderId,
        /// Expected current status
        from: OrderStatus,
        /// Requested new status
        to: OrderStatus,
    },

    /// Order not found.
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Stored data could not be decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result of [`OrderStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new record was inserted.
    Created(Order),
    /// A record with this id already existed; it is returned unchanged.
    Existing(Order),
}

impl CreateOutcome {
    /// The order record, new or existing.
    #[must_use]
    pub fn into_order(self) -> Order {
        match self {
            Self::Created(order) | Self::Existing(order) => order,
        }
    }
}

/// A conditional status change plus the fields that change with it.
///
/// # Examples
///
/// ```
/// use order_gateway_core::order::OrderStatus;
/// use order_gateway_core::order_store::OrderUpdate;
/// use chrono::Utc;
///
/// let update = OrderUpdate::new(OrderStatus::Queued, Utc::now())
///     .add_attempts(2)
///     .last_error("partner returned 503");
/// assert_eq!(update.status, OrderStatus::Queued);
/// assert_eq!(update.add_attempts, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    /// New status
    pub status: OrderStatus,
    /// Attempts to add to the stored count
    pub add_attempts: u32,
    /// Correlation id to record, if any
    pub correlation_id: Option<String>,
    /// Diagnostic to record, if any (existing value kept otherwise)
    pub last_error: Option<String>,
    /// Timestamp written to `updated_at`
    pub at: DateTime<Utc>,
}

impl OrderUpdate {
    /// Start an update to `status`, stamped at `at`.
    #[must_use]
    pub const fn new(status: OrderStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            add_attempts: 0,
            correlation_id: None,
            last_error: None,
            at,
        }
    }

    /// Charge partner call attempts to the order.
    #[must_use]
    pub const fn add_attempts(mut self, attempts: u32) -> Self {
        self.add_attempts = attempts;
        self
    }

    /// Record the partner-assigned correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Record a failure diagnostic.
    #[must_use]
    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Check every expected predecessor can legally move to the new status.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::InvalidTransition`] for the first
    /// predecessor that cannot.
    pub fn validate(&self, order_id: OrderId, expected: &[OrderStatus]) -> Result<(), OrderStoreError> {
        match expected.iter().find(|from| !from.can_transition_to(self.status)) {
            Some(from) => Err(OrderStoreError::InvalidTransition {
                order_id,
                from: *from,
                to: self.status,
            }),
            None => Ok(()),
        }
    }

    /// Apply the update to an in-memory record.
    ///
    /// Used by implementations that hold full records; SQL implementations
    /// express the same assignment in their `UPDATE`.
    pub fn apply(&self, order: &mut Order) {
        order.status = self.status;
        order.attempts = order.attempts.saturating_add(self.add_attempts);
        if let Some(correlation_id) = &self.correlation_id {
            order.correlation_id = Some(correlation_id.clone());
        }
        if let Some(error) = &self.last_error {
            order.last_error = Some(error.clone());
        }
        order.updated_at = self.at;
    }
}

/// Persistence for order records with compare-and-set updates.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn OrderStore>` between the service, the workers, and the sweep.
pub trait OrderStore: Send + Sync {
    /// Insert a new `CREATED` record unless one already exists.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: storage failure
    fn create(
        &self,
        order_id: OrderId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<CreateOutcome, OrderStoreError>> + Send + '_>>;

    /// Load an order.
    ///
    /// Returns `Ok(None)` for an unknown id.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: storage failure
    /// - `SerializationError`: stored row could not be decoded
    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderStoreError>> + Send + '_>>;

    /// Apply `update` only if the stored status is one of `expected`.
    ///
    /// Returns the updated record, or `Ok(None)` if the order is unknown or
    /// its status is not in `expected` (the write lost the race).
    ///
    /// # Errors
    ///
    /// - `InvalidTransition`: an expected status cannot move to `update.status`
    /// - `DatabaseError`: storage failure
    fn transition(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        update: OrderUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderStoreError>> + Send + '_>>;

    /// Store the partner result payload on a `COMPLETED` order.
    ///
    /// Returns `false` if the order is not `COMPLETED`.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: storage failure
    fn attach_result(
        &self,
        order_id: OrderId,
        result: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OrderStoreError>> + Send + '_>>;

    /// Record a diagnostic without changing status.
    ///
    /// Returns `false` for an unknown order.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: storage failure
    fn record_error(
        &self,
        order_id: OrderId,
        error: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OrderStoreError>> + Send + '_>>;

    /// Orders in one of `statuses` not updated since `updated_before`,
    /// oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: storage failure
    fn list_stale(
        &self,
        statuses: &[OrderStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderStoreError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id(raw: i64) -> OrderId {
        OrderId::new(raw).unwrap()
    }

    #[test]
    fn validate_rejects_backward_edges() {
        let update = OrderUpdate::new(OrderStatus::Queued, Utc::now());
        let err = update
            .validate(id(1), &[OrderStatus::Sent, OrderStatus::Completed])
            .unwrap_err();
        assert!(matches!(
            err,
            OrderStoreError::InvalidTransition {
                from: OrderStatus::Completed,
                to: OrderStatus::Queued,
                ..
            }
        ));
    }

    #[test]
    fn apply_accumulates_attempts_and_keeps_error() {
        let created = Utc::now();
        let mut order = Order::new(id(5), created);
        order.last_error = Some("earlier".into());

        OrderUpdate::new(OrderStatus::Queued, created)
            .add_attempts(2)
            .apply(&mut order);
        assert_eq!(order.attempts, 2);
        assert_eq!(order.last_error.as_deref(), Some("earlier"));

        let later = created + chrono::Duration::seconds(5);
        OrderUpdate::new(OrderStatus::Sent, later)
            .add_attempts(1)
            .correlation_id("abc")
            .last_error("timeout")
            .apply(&mut order);
        assert_eq!(order.attempts, 3);
        assert_eq!(order.correlation_id.as_deref(), Some("abc"));
        assert_eq!(order.last_error.as_deref(), Some("timeout"));
        assert_eq!(order.updated_at, later);
        assert_eq!(order.created_at, created);
    }

    #[test]
    fn not_found_error_display() {
        let display = OrderStoreError::NotFound(id(77)).to_string();
        assert!(display.contains("77"));
    }
}
