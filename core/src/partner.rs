//! Partner service abstraction.
//!
//! The partner accepts a request for an order and, some time later, serves
//! its result under the correlation id it assigned.

use crate::order::OrderId;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from partner calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartnerError {
    /// Connect or read timeout elapsed
    #[error("Partner request timed out: {0}")]
    Timeout(String),

    /// Could not establish a connection
    #[error("Partner connection failed: {0}")]
    Connect(String),

    /// Partner answered with a non-success status
    #[error("Partner returned status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Result is not ready yet
    #[error("Partner result not ready")]
    NotReady,

    /// Response body could not be decoded
    #[error("Partner response could not be decoded: {0}")]
    Decode(String),
}

/// Partner acknowledgment of a created request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerReceipt {
    /// Id assigned by the partner
    pub correlation_id: String,
}

/// Outcome of a result lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PartnerResult {
    /// The result is available
    Ready(serde_json::Value),
    /// The partner is still working on it
    Pending,
}

/// Outbound client for the partner service.
///
/// Implementations perform a single call per method; retries and circuit
/// breaking are layered on top by the runtime.
pub trait PartnerClient: Send + Sync {
    /// Submit a request for `order_id`.
    ///
    /// # Errors
    ///
    /// Any [`PartnerError`].
    fn create_request(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<PartnerReceipt, PartnerError>> + Send + '_>>;

    /// Look up the result for an accepted request.
    ///
    /// # Errors
    ///
    /// Any [`PartnerError`].
    fn get_result(
        &self,
        order_id: OrderId,
        correlation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PartnerResult, PartnerError>> + Send + '_>>;

    /// The partner's catalogue of request kinds.
    ///
    /// # Errors
    ///
    /// Any [`PartnerError`].
    fn request_kinds(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, PartnerError>> + Send + '_>>;
}
