//! In-memory order store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::{DateTime, Utc};
use order_gateway_core::order::{Order, OrderId, OrderStatus};
use order_gateway_core::order_store::{CreateOutcome, OrderStore, OrderStoreError, OrderUpdate};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// HashMap-backed [`OrderStore`] with the same conditional-write semantics
/// as the Postgres store.
///
/// # Example
///
/// ```
/// use order_gateway_testing::InMemoryOrderStore;
/// use order_gateway_core::order::{OrderId, OrderStatus};
/// use order_gateway_core::order_store::{OrderStore, OrderUpdate};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryOrderStore::new();
/// let id = OrderId::new(1)?;
/// store.create(id, Utc::now()).await?;
///
/// let queued = store
///     .transition(id, &[OrderStatus::Created], OrderUpdate::new(OrderStatus::Queued, Utc::now()))
///     .await?;
/// assert!(queued.is_some());
///
/// // The second writer loses.
/// let again = store
///     .transition(id, &[OrderStatus::Created], OrderUpdate::new(OrderStatus::Queued, Utc::now()))
///     .await?;
/// assert!(again.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl InMemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is, bypassing transition checks.
    ///
    /// Useful for seeding a test with an order in a specific state.
    pub fn insert(&self, order: Order) {
        self.orders.write().unwrap().insert(order.order_id, order);
    }

    /// Current record, read synchronously.
    #[must_use]
    pub fn snapshot(&self, order_id: OrderId) -> Option<Order> {
        self.orders.read().unwrap().get(&order_id).cloned()
    }

    /// Number of stored orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.read().unwrap().is_empty()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn create(
        &self,
        order_id: OrderId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<CreateOutcome, OrderStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut orders = self.orders.write().unwrap();
            if let Some(existing) = orders.get(&order_id) {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
            let order = Order::new(order_id, at);
            orders.insert(order_id, order.clone());
            Ok(CreateOutcome::Created(order))
        })
    }

    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderStoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.snapshot(order_id)) })
    }

    fn transition(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        update: OrderUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderStoreError>> + Send + '_>> {
        let expected = expected.to_vec();
        Box::pin(async move {
            update.validate(order_id, &expected)?;

            let mut orders = self.orders.write().unwrap();
            match orders.get_mut(&order_id) {
                Some(order) if expected.contains(&order.status) => {
                    update.apply(order);
                    Ok(Some(order.clone()))
                }
                _ => Ok(None),
            }
        })
    }

    fn attach_result(
        &self,
        order_id: OrderId,
        result: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OrderStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut orders = self.orders.write().unwrap();
            match orders.get_mut(&order_id) {
                Some(order) if order.status == OrderStatus::Completed => {
                    order.result = Some(result);
                    order.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn record_error(
        &self,
        order_id: OrderId,
        error: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OrderStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut orders = self.orders.write().unwrap();
            match orders.get_mut(&order_id) {
                Some(order) => {
                    order.last_error = Some(error);
                    order.updated_at = at;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn list_stale(
        &self,
        statuses: &[OrderStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderStoreError>> + Send + '_>> {
        let statuses = statuses.to_vec();
        Box::pin(async move {
            let mut stale: Vec<Order> = self
                .orders
                .read()
                .unwrap()
                .values()
                .filter(|order| statuses.contains(&order.status) && order.updated_at < updated_before)
                .cloned()
                .collect();
            stale.sort_by_key(|order| (order.updated_at, order.order_id));
            stale.truncate(limit);
            Ok(stale)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> OrderId {
        OrderId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = InMemoryOrderStore::new();
        let now = Utc::now();

        assert!(matches!(store.create(id(1), now).await.unwrap(), CreateOutcome::Created(_)));
        assert!(matches!(store.create(id(1), now).await.unwrap(), CreateOutcome::Existing(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn backward_transition_is_rejected_before_write() {
        let store = InMemoryOrderStore::new();
        let now = Utc::now();
        store.create(id(2), now).await.unwrap();

        let err = store
            .transition(id(2), &[OrderStatus::Completed], OrderUpdate::new(OrderStatus::Queued, now))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderStoreError::InvalidTransition { .. }));
        assert_eq!(store.snapshot(id(2)).unwrap().status, OrderStatus::Created);
    }

    #[tokio::test]
    async fn result_only_attaches_to_completed_orders() {
        let store = InMemoryOrderStore::new();
        let now = Utc::now();
        store.create(id(3), now).await.unwrap();

        let attached = store
            .attach_result(id(3), serde_json::json!({"ok": true}), now)
            .await
            .unwrap();
        assert!(!attached);
    }

    #[tokio::test]
    async fn stale_listing_is_oldest_first_and_bounded() {
        let store = InMemoryOrderStore::new();
        let base = Utc::now() - chrono::Duration::minutes(30);
        for (raw, minutes) in [(1, 10), (2, 5), (3, 20)] {
            let mut order = Order::new(id(raw), base);
            order.status = OrderStatus::Sent;
            order.updated_at = base + chrono::Duration::minutes(minutes);
            store.insert(order);
        }

        let stale = store
            .list_stale(&OrderStatus::IN_FLIGHT, base + chrono::Duration::minutes(15), 10)
            .await
            .unwrap();
        let ids: Vec<i64> = stale.iter().map(|o| o.order_id.get()).collect();
        assert_eq!(ids, vec![2, 1]);

        let bounded = store
            .list_stale(&OrderStatus::IN_FLIGHT, Utc::now(), 1)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
    }
}
