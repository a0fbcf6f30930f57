//! Caller-facing error type for the order gateway.

use crate::order::{InvalidOrderId, OrderId};
use crate::order_store::OrderStoreError;
use crate::stream_bus::StreamBusError;
use thiserror::Error;

/// Errors surfaced by the order service.
///
/// `Validation`, `AlreadyExists` and `NotFound` go straight back to the
/// caller. The upstream variants describe why an order ended up
/// dead-lettered; callers observe them through the order's `last_error`.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Request input is invalid
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The order was already submitted
    #[error("Order {0} already exists")]
    AlreadyExists(OrderId),

    /// Unknown order (or correlation id mismatch)
    #[error("Order {0} not found")]
    NotFound(OrderId),

    /// Partner destination is failing fast
    #[error("Circuit open for destination '{0}'")]
    CircuitOpen(String),

    /// Partner failed with a retryable condition
    #[error("Transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Partner rejected the request
    #[error("Permanent upstream failure: {0}")]
    PermanentUpstream(String),

    /// The order was moved to the dead-letter stream
    #[error("Order {order_id} dead-lettered: {reason}")]
    DeadLettered {
        /// The order
        order_id: OrderId,
        /// Why it was dead-lettered
        reason: String,
    },

    /// Order store failure
    #[error(transparent)]
    Store(#[from] OrderStoreError),

    /// Stream bus failure
    #[error(transparent)]
    Bus(#[from] StreamBusError),
}

impl From<InvalidOrderId> for GatewayError {
    fn from(err: InvalidOrderId) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, GatewayError>;
