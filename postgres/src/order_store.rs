//! `orders` table access.

use chrono::{DateTime, Utc};
use order_gateway_core::order::{Order, OrderId, OrderStatus};
use order_gateway_core::order_store::{CreateOutcome, OrderStore, OrderStoreError, OrderUpdate};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// DDL applied by [`PostgresOrderStore::ensure_schema`].
pub const SCHEMA: [&str; 2] = [
    r"
    CREATE TABLE IF NOT EXISTS orders (
        order_id BIGINT PRIMARY KEY CHECK (order_id > 0),
        correlation_id TEXT,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        result JSONB,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_orders_status_updated ON orders(status, updated_at)",
];

const COLUMNS: &str =
    "order_id, correlation_id, status, attempts, last_error, result, created_at, updated_at";

/// `PostgreSQL`-backed [`OrderStore`].
///
/// Every status change is a single conditional `UPDATE`, so concurrent
/// workers racing on the same order serialize on the row lock and exactly
/// one of them sees its expected status.
#[derive(Clone, Debug)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Connect with a default pool.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, OrderStoreError> {
        Self::connect(database_url, 10).await
    }

    /// Connect with at most `max_connections` pooled connections.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, OrderStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `orders` table and its index if missing.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if a statement fails.
    pub async fn ensure_schema(&self) -> Result<(), OrderStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;
        }
        tracing::debug!("Order schema ready");
        Ok(())
    }

    async fn fetch(&self, order_id: OrderId) -> Result<Option<Order>, OrderStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM orders WHERE order_id = $1"))
            .bind(order_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        row.as_ref().map(row_to_order).transpose()
    }
}

fn status_names(statuses: &[OrderStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

/// Convert a database row to an [`Order`].
fn row_to_order(row: &PgRow) -> Result<Order, OrderStoreError> {
    let decode = |e: sqlx::Error| OrderStoreError::SerializationError(e.to_string());

    let raw_id: i64 = row.try_get("order_id").map_err(decode)?;
    let order_id =
        OrderId::new(raw_id).map_err(|e| OrderStoreError::SerializationError(e.to_string()))?;

    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<OrderStatus>()
        .map_err(|e| OrderStoreError::SerializationError(e.to_string()))?;

    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let attempts = u32::try_from(attempts).map_err(|_| {
        OrderStoreError::SerializationError(format!("Negative attempts for order {order_id}"))
    })?;

    Ok(Order {
        order_id,
        correlation_id: row.try_get("correlation_id").map_err(decode)?,
        status,
        attempts,
        last_error: row.try_get("last_error").map_err(decode)?,
        result: row.try_get("result").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

impl OrderStore for PostgresOrderStore {
    fn create(
        &self,
        order_id: OrderId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<CreateOutcome, OrderStoreError>> + Send + '_>> {
        Box::pin(async move {
            let inserted = sqlx::query(&format!(
                r"
                INSERT INTO orders (order_id, status, attempts, created_at, updated_at)
                VALUES ($1, $2, 0, $3, $3)
                ON CONFLICT (order_id) DO NOTHING
                RETURNING {COLUMNS}
                "
            ))
            .bind(order_id.get())
            .bind(OrderStatus::Created.as_str())
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

            if let Some(row) = inserted {
                return Ok(CreateOutcome::Created(row_to_order(&row)?));
            }

            match self.fetch(order_id).await? {
                Some(existing) => {
                    tracing::debug!(order_id = %order_id, status = %existing.status, "Order already exists");
                    Ok(CreateOutcome::Existing(existing))
                }
                None => Err(OrderStoreError::NotFound(order_id)),
            }
        })
    }

    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderStoreError>> + Send + '_>> {
        Box::pin(async move { self.fetch(order_id).await })
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

            let add_attempts = i32::try_from(update.add_attempts).unwrap_or(i32::MAX);
            let row = sqlx::query(&format!(
                r"
                UPDATE orders
                SET status = $1,
                    attempts = attempts + $2,
                    correlation_id = COALESCE($3, correlation_id),
                    last_error = COALESCE($4, last_error),
                    updated_at = $5
                WHERE order_id = $6 AND status = ANY($7)
                RETURNING {COLUMNS}
                "
            ))
            .bind(update.status.as_str())
            .bind(add_attempts)
            .bind(update.correlation_id.as_deref())
            .bind(update.last_error.as_deref())
            .bind(update.at)
            .bind(order_id.get())
            .bind(status_names(&expected))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

            match row {
                Some(row) => Ok(Some(row_to_order(&row)?)),
                None => {
                    tracing::debug!(
                        order_id = %order_id,
                        to = %update.status,
                        "Conditional write lost"
                    );
                    metrics::counter!("order_store_conflicts_total").increment(1);
                    Ok(None)
                }
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
            let updated = sqlx::query(
                r"
                UPDATE orders
                SET result = $1, updated_at = $2
                WHERE order_id = $3 AND status = $4
                ",
            )
            .bind(result)
            .bind(at)
            .bind(order_id.get())
            .bind(OrderStatus::Completed.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

            Ok(updated.rows_affected() > 0)
        })
    }

    fn record_error(
        &self,
        order_id: OrderId,
        error: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OrderStoreError>> + Send + '_>> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE orders
                SET last_error = $1, updated_at = $2
                WHERE order_id = $3
                ",
            )
            .bind(error)
            .bind(at)
            .bind(order_id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

            Ok(updated.rows_affected() > 0)
        })
    }

    fn list_stale(
        &self,
        statuses: &[OrderStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderStoreError>> + Send + '_>> {
        let statuses = status_names(statuses);
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Batch sizes are small
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM orders
                WHERE status = ANY($1) AND updated_at < $2
                ORDER BY updated_at ASC, order_id ASC
                LIMIT $3
                "
            ))
            .bind(statuses)
            .bind(updated_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

            rows.iter().map(row_to_order).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_use_storage_representation() {
        assert_eq!(
            status_names(&OrderStatus::IN_FLIGHT),
            vec!["queued", "sent", "in_progress"]
        );
    }

    #[test]
    fn schema_creates_the_orders_table() {
        assert!(SCHEMA[0].contains("CREATE TABLE IF NOT EXISTS orders"));
        assert!(SCHEMA.iter().all(|statement| statement.contains("IF NOT EXISTS")));
    }
}
