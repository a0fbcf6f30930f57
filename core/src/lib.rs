//! # Order Gateway Core
//!
//! Core types and traits for the order gateway pipeline.
//!
//! The gateway accepts orders, hands them to a stream-backed worker pipeline
//! that calls an external partner service under circuit-breaker and retry
//! controls, and answers status queries from the order store.
//!
//! ## Core Concepts
//!
//! - **Order**: canonical record with a monotonic lifecycle ([`order`])
//! - **Order store**: compare-and-set persistence ([`order_store`])
//! - **Stream bus**: main and dead-letter streams with consumer groups ([`stream_bus`])
//! - **Partner client**: the outbound dependency ([`partner`])
//! - **Configuration**: environment-driven settings ([`config`])
//!
//! ## Architecture
//!
//! ```text
//! CreateOrder ──► OrderStore (CREATED → QUEUED) ──► main stream
//!                                                      │
//!                                                 worker pool
//!                                                      │
//!                                 CallGuard (breaker + retry) ──► partner
//!                                                      │
//!                     OrderStore (COMPLETED | QUEUED | FAILED → DEAD_LETTERED)
//!                                                      │
//!                                               dead-letter stream
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod order;
pub mod order_store;
pub mod partner;
pub mod stream;
pub mod stream_bus;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::GatewayError;
pub use order::{Order, OrderId, OrderStatus};
