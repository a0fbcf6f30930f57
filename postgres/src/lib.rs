//! `PostgreSQL` order store for the order gateway.
//!
//! This crate provides the production implementation of the `OrderStore`
//! trait from `order-gateway-core`:
//!
//! - One row per order, keyed by `order_id`
//! - Compare-and-set status changes in a single `UPDATE ... WHERE status = ANY(..)`
//! - Idempotent creation via `INSERT ... ON CONFLICT DO NOTHING`
//! - Connection pooling through `sqlx::PgPool`
//!
//! # Example
//!
//! ```no_run
//! use order_gateway_postgres::PostgresOrderStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresOrderStore::new("postgres://localhost/gateway").await?;
//! store.ensure_schema().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod order_store;

pub use order_store::{PostgresOrderStore, SCHEMA};
