//! Status query service: the caller-facing surface of the gateway.
//!
//! `create_order` records an order and hands it to the pipeline;
//! `get_order_result` reports the latest stored state without waiting on
//! in-flight work.

use order_gateway_core::config::StreamConfig;
use order_gateway_core::environment::Clock;
use order_gateway_core::error::{GatewayError, Result};
use order_gateway_core::order::{Order, OrderId, OrderStatus};
use order_gateway_core::order_store::{OrderStore, OrderUpdate};
use order_gateway_core::stream::StreamMessage;
use order_gateway_core::stream_bus::StreamBus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Response shape shared by every service call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResponse {
    /// The order id
    pub order_id: i64,
    /// Partner correlation id, empty until assigned
    pub correlation_id: String,
    /// External status string
    pub status: String,
    /// Last failure diagnostic, empty if none
    pub error: String,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id.get(),
            correlation_id: order.correlation_id.clone().unwrap_or_default(),
            status: order.status.external_str().to_string(),
            error: order.last_error.clone().unwrap_or_default(),
        }
    }
}

/// Order service.
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    bus: Arc<dyn StreamBus>,
    clock: Arc<dyn Clock>,
    streams: StreamConfig,
}

impl OrderService {
    /// Create a service.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        bus: Arc<dyn StreamBus>,
        clock: Arc<dyn Clock>,
        streams: &StreamConfig,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            streams: streams.clone(),
        }
    }

    /// Register a new order and queue it for sending.
    ///
    /// The conditional `CREATED → QUEUED` write decides which caller owns the
    /// order; only that caller publishes. If the publish fails the order
    /// stays `QUEUED` and the sweep re-publishes it.
    ///
    /// # Errors
    ///
    /// - `Validation`: `order_id` is not positive
    /// - `AlreadyExists`: the order was submitted before
    /// - `Store`: storage failure
    pub async fn create_order(&self, order_id: i64) -> Result<OrderResponse> {
        let order_id = OrderId::new(order_id)?;
        let now = self.clock.now();

        let order = self.store.create(order_id, now).await?.into_order();
        if order.status != OrderStatus::Created {
            return Err(GatewayError::AlreadyExists(order_id));
        }

        let Some(queued) = self
            .store
            .transition(order_id, &[OrderStatus::Created], OrderUpdate::new(OrderStatus::Queued, now))
            .await?
        else {
            return Err(GatewayError::AlreadyExists(order_id));
        };

        let message = StreamMessage::send(order_id, queued.attempts, now);
        match self.bus.publish(&self.streams.main_stream, &message).await {
            Ok(event_id) => info!(order_id = %order_id, event_id = %event_id, "Order created"),
            Err(e) => warn!(
                order_id = %order_id,
                error = %e,
                "Order created but publish failed; sweep will re-publish"
            ),
        }
        metrics::counter!("gateway_orders_created_total").increment(1);

        let mut response = OrderResponse::from(&queued);
        response.status = OrderStatus::Created.external_str().to_string();
        Ok(response)
    }

    /// Latest stored state of an order.
    ///
    /// A non-empty `correlation_id` must match the stored one.
    ///
    /// # Errors
    ///
    /// - `Validation`: `order_id` is not positive
    /// - `NotFound`: unknown order or mismatched correlation id
    /// - `Store`: storage failure
    pub async fn get_order_result(&self, order_id: i64, correlation_id: &str) -> Result<OrderResponse> {
        let order_id = OrderId::new(order_id)?;
        let found = self.store.get(order_id).await?.filter(|order| {
            correlation_id.is_empty() || order.correlation_id.as_deref() == Some(correlation_id)
        });

        let outcome = if found.is_some() { "found" } else { "not_found" };
        metrics::counter!("gateway_order_queries_total", "outcome" => outcome).increment(1);

        match found {
            Some(order) => {
                debug!(order_id = %order_id, status = %order.status, "Order queried");
                Ok(OrderResponse::from(&order))
            }
            None => Err(GatewayError::NotFound(order_id)),
        }
    }

    /// Ask a worker to fetch the partner's result payload for a completed
    /// order.
    ///
    /// # Errors
    ///
    /// - `Validation`: bad id, or the order is not completed with a
    ///   correlation id
    /// - `NotFound`: unknown order
    /// - `Store`, `Bus`: infrastructure failure
    pub async fn request_result(&self, order_id: i64) -> Result<OrderResponse> {
        let order_id = OrderId::new(order_id)?;
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or(GatewayError::NotFound(order_id))?;

        let correlation_id = match (&order.status, &order.correlation_id) {
            (OrderStatus::Completed, Some(correlation_id)) => correlation_id.clone(),
            _ => {
                return Err(GatewayError::Validation(format!(
                    "order {order_id} has no partner result to fetch (status {})",
                    order.status
                )));
            }
        };

        let message = StreamMessage::get_result(order_id, correlation_id, order.attempts, self.clock.now());
        self.bus
            .publish(&self.streams.main_stream, &message)
            .await?;
        info!(order_id = %order_id, "Result fetch requested");
        Ok(OrderResponse::from(&order))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use order_gateway_core::config::GatewayConfig;
    use order_gateway_core::environment::SystemClock;
    use order_gateway_testing::{InMemoryOrderStore, InMemoryStreamBus};

    fn service() -> (OrderService, Arc<InMemoryStreamBus>) {
        let config = GatewayConfig::default();
        let bus = Arc::new(InMemoryStreamBus::new(config.stream.clone()));
        let service = OrderService::new(
            Arc::new(InMemoryOrderStore::new()),
            bus.clone(),
            Arc::new(SystemClock),
            &config.stream,
        );
        (service, bus)
    }

    #[tokio::test]
    async fn create_publishes_one_send() {
        let (service, bus) = service();
        let response = service.create_order(42).await.unwrap();

        assert_eq!(response.order_id, 42);
        assert_eq!(response.status, "created");
        assert!(response.correlation_id.is_empty());
        assert_eq!(bus.len("orders:main").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected_without_publishing() {
        let (service, bus) = service();
        service.create_order(7).await.unwrap();

        let err = service.create_order(7).await.unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyExists(id) if id.get() == 7));
        assert_eq!(bus.len("orders:main").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_positive_id_is_a_validation_error() {
        let (service, _) = service();
        assert!(matches!(
            service.create_order(0).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn query_reports_queued_order() {
        let (service, _) = service();
        service.create_order(3).await.unwrap();

        let response = service.get_order_result(3, "").await.unwrap();
        assert_eq!(response.status, "queued");
        assert!(response.error.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (service, _) = service();
        assert!(matches!(
            service.get_order_result(99, "").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mismatched_correlation_id_is_not_found() {
        let (service, _) = service();
        service.create_order(5).await.unwrap();
        assert!(matches!(
            service.get_order_result(5, "someone-else").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn result_request_needs_a_completed_order() {
        let (service, _) = service();
        service.create_order(8).await.unwrap();
        assert!(matches!(
            service.request_result(8).await,
            Err(GatewayError::Validation(_))
        ));
    }
}
