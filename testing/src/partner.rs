//! Scripted partner client.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use order_gateway_core::order::OrderId;
use order_gateway_core::partner::{PartnerClient, PartnerError, PartnerReceipt, PartnerResult};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// [`PartnerClient`] that replays queued responses.
///
/// Once a queue is empty the partner succeeds: `create_request` returns
/// correlation id `corr-<order_id>` and `get_result` returns a small JSON
/// payload. Every call is counted.
///
/// # Example
///
/// ```
/// use order_gateway_testing::ScriptedPartner;
/// use order_gateway_core::partner::{PartnerClient, PartnerError};
/// use order_gateway_core::order::OrderId;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let partner = ScriptedPartner::new()
///     .fail_create(2, PartnerError::Timeout("read".into()));
///
/// let id = OrderId::new(1)?;
/// assert!(partner.create_request(id).await.is_err());
/// assert!(partner.create_request(id).await.is_err());
/// assert!(partner.create_request(id).await.is_ok());
/// assert_eq!(partner.create_calls(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ScriptedPartner {
    creates: Mutex<VecDeque<Result<PartnerReceipt, PartnerError>>>,
    results: Mutex<VecDeque<Result<PartnerResult, PartnerError>>>,
    create_calls: AtomicU32,
    result_calls: AtomicU32,
    latency: Option<Duration>,
}

impl ScriptedPartner {
    /// A partner that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `times` failures for `create_request`.
    #[must_use]
    pub fn fail_create(self, times: usize, error: PartnerError) -> Self {
        self.creates
            .lock()
            .unwrap()
            .extend(std::iter::repeat_n(Err(error), times));
        self
    }

    /// Queue one `create_request` response.
    #[must_use]
    pub fn then_create(self, response: Result<PartnerReceipt, PartnerError>) -> Self {
        self.creates.lock().unwrap().push_back(response);
        self
    }

    /// Queue one `get_result` response.
    #[must_use]
    pub fn then_result(self, response: Result<PartnerResult, PartnerError>) -> Self {
        self.results.lock().unwrap().push_back(response);
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `create_request` calls so far.
    #[must_use]
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `get_result` calls so far.
    #[must_use]
    pub fn result_calls(&self) -> u32 {
        self.result_calls.load(Ordering::SeqCst)
    }

    /// Shareable handle.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl PartnerClient for ScriptedPartner {
    fn create_request(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<PartnerReceipt, PartnerError>> + Send + '_>> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.wait().await;
            let scripted = self.creates.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(PartnerReceipt {
                    correlation_id: format!("corr-{order_id}"),
                })
            })
        })
    }

    fn get_result(
        &self,
        order_id: OrderId,
        correlation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<PartnerResult, PartnerError>> + Send + '_>> {
        let correlation_id = correlation_id.to_string();
        Box::pin(async move {
            self.result_calls.fetch_add(1, Ordering::SeqCst);
            self.wait().await;
            let scripted = self.results.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(PartnerResult::Ready(serde_json::json!({
                    "order_id": order_id.get(),
                    "correlation_id": correlation_id,
                    "status": "DONE",
                })))
            })
        })
    }

    fn request_kinds(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, PartnerError>> + Send + '_>> {
        Box::pin(async move { Ok(serde_json::json!([{ "kind": "STANDARD" }])) })
    }
}
