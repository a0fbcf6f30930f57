//! Integration tests for [`RedisStreamBus`] against a real Redis instance.
//!
//! These tests validate:
//! - Append / read / acknowledge through a consumer group
//! - Pending-entry redelivery with `XAUTOCLAIM`
//! - Length and age based trimming
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker to be running (for testcontainers).
//!
//! To run explicitly:
//! ```bash
//! cargo test -p order-gateway-redis --test integration_tests -- --ignored
//! ```
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use order_gateway_core::config::StreamConfig;
use order_gateway_core::order::OrderId;
use order_gateway_core::stream::StreamMessage;
use order_gateway_core::stream_bus::{StreamBus, StreamBusError};
use order_gateway_redis::RedisStreamBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::{REDIS_PORT, Redis};

const STREAM: &str = "orders:main";
const GROUP: &str = "order-workers";

/// Start Redis 7 and connect a bus with the given config.
///
/// Returns both the container (to keep it alive) and the bus.
async fn setup_bus(config: StreamConfig) -> (ContainerAsync<Redis>, RedisStreamBus) {
    let container = Redis::default()
        .with_tag("7.2")
        .start()
        .await
        .expect("Failed to start redis container");

    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");
    let url = format!("redis://127.0.0.1:{port}");

    let max_retries = 30;
    for _ in 0..max_retries {
        if let Ok(bus) = RedisStreamBus::new(&url, config.clone()).await {
            if bus.ping().await.is_ok() {
                return (container, bus);
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("Redis not ready after {max_retries} retries");
}

/// A plain connection for commands the bus does not expose.
async fn raw_connection(container: &ContainerAsync<Redis>) -> redis::aio::MultiplexedConnection {
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");
    redis::Client::open(format!("redis://127.0.0.1:{port}"))
        .expect("client")
        .get_multiplexed_async_connection()
        .await
        .expect("connection")
}

fn send(raw: i64) -> StreamMessage {
    StreamMessage::send(OrderId::new(raw).expect("positive id"), 0, Utc::now())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_append_read_ack_cycle() {
    let (_container, bus) = setup_bus(StreamConfig::default()).await;
    bus.ensure_group(STREAM, GROUP).await.expect("group");

    let id = bus.publish(STREAM, &send(42)).await.expect("publish");

    let events = bus
        .read_group(STREAM, GROUP, "worker-0", 10, Duration::from_millis(200))
        .await
        .expect("read");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, id);
    assert_eq!(events[0].delivery_count, 1);
    assert_eq!(events[0].message().expect("decode").order_id.get(), 42);

    assert_eq!(bus.pending_count(STREAM, GROUP).await.expect("pending"), 1);
    assert!(bus.ack(STREAM, GROUP, id).await.expect("ack"));
    assert!(!bus.ack(STREAM, GROUP, id).await.expect("second ack"));
    assert_eq!(bus.pending_count(STREAM, GROUP).await.expect("pending"), 0);
    assert_eq!(bus.len(STREAM).await.expect("len"), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ensure_group_is_idempotent() {
    let (_container, bus) = setup_bus(StreamConfig::default()).await;
    bus.ensure_group(STREAM, GROUP).await.expect("first");
    bus.ensure_group(STREAM, GROUP).await.expect("second");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_read_without_group_fails() {
    let (_container, bus) = setup_bus(StreamConfig::default()).await;
    bus.publish(STREAM, &send(1)).await.expect("publish");

    let result = bus
        .read_group(STREAM, "missing", "worker-0", 1, Duration::ZERO)
        .await;
    assert!(matches!(result, Err(StreamBusError::ConsumerGroupError(_))));
    assert_eq!(bus.pending_count(STREAM, "missing").await.expect("pending"), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_empty_read_waits_for_block_window() {
    let (_container, bus) = setup_bus(StreamConfig::default()).await;
    bus.ensure_group(STREAM, GROUP).await.expect("group");

    let started = tokio::time::Instant::now();
    let events = bus
        .read_group(STREAM, GROUP, "worker-0", 1, Duration::from_millis(300))
        .await
        .expect("read");
    assert!(events.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unacked_entry_is_claimed_by_another_consumer() {
    let (_container, bus) = setup_bus(StreamConfig::default()).await;
    bus.ensure_group(STREAM, GROUP).await.expect("group");
    let id = bus.publish(STREAM, &send(7)).await.expect("publish");

    let first = bus
        .read_group(STREAM, GROUP, "worker-0", 1, Duration::ZERO)
        .await
        .expect("read");
    assert_eq!(first.len(), 1);

    // Not idle long enough yet.
    let early = bus
        .claim_stale(STREAM, GROUP, "worker-1", Duration::from_secs(10), 10)
        .await
        .expect("claim");
    assert!(early.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let claimed = bus
        .claim_stale(STREAM, GROUP, "worker-1", Duration::from_millis(100), 10)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
    assert_eq!(claimed[0].delivery_count, 2);

    assert!(bus.ack(STREAM, GROUP, id).await.expect("ack"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_claimed_delivery_counts_skip_busy_entries_in_between() {
    let (container, bus) = setup_bus(StreamConfig::default()).await;
    bus.ensure_group(STREAM, GROUP).await.expect("group");
    let a = bus.publish(STREAM, &send(1)).await.expect("publish");
    let b = bus.publish(STREAM, &send(2)).await.expect("publish");
    let c = bus.publish(STREAM, &send(3)).await.expect("publish");

    bus.read_group(STREAM, GROUP, "worker-0", 3, Duration::ZERO)
        .await
        .expect("read");
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = bus
        .claim_stale(STREAM, GROUP, "worker-1", Duration::from_millis(100), 10)
        .await
        .expect("claim");
    assert!(second.iter().all(|event| event.delivery_count == 2));

    // b stays busy (JUSTID resets idle time without counting a delivery).
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut conn = raw_connection(&container).await;
    let _: redis::Value = redis::cmd("XCLAIM")
        .arg(STREAM)
        .arg(GROUP)
        .arg("worker-1")
        .arg(0)
        .arg(b.to_string())
        .arg("JUSTID")
        .query_async(&mut conn)
        .await
        .expect("xclaim");

    let third = bus
        .claim_stale(STREAM, GROUP, "worker-2", Duration::from_millis(100), 10)
        .await
        .expect("claim");
    let ids: Vec<_> = third.iter().map(|event| event.id).collect();
    assert_eq!(ids, vec![a, c]);
    assert!(third.iter().all(|event| event.delivery_count == 3));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_exact_length_trimming_on_append() {
    let config = StreamConfig {
        max_len: 5,
        approximate_trimming: false,
        ..StreamConfig::default()
    };
    let (_container, bus) = setup_bus(config).await;

    for raw in 1..=10 {
        bus.publish(STREAM, &send(raw)).await.expect("publish");
    }
    assert_eq!(bus.len(STREAM).await.expect("len"), 5);

    let oldest = bus.range(STREAM, 1).await.expect("range");
    assert_eq!(oldest[0].message().expect("decode").order_id.get(), 6);
    assert_eq!(oldest[0].delivery_count, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_trim_keeps_fresh_entries() {
    let (_container, bus) = setup_bus(StreamConfig::default()).await;
    for raw in 1..=3 {
        bus.publish(STREAM, &send(raw)).await.expect("publish");
    }

    assert_eq!(bus.trim(STREAM).await.expect("trim"), 0);
    assert_eq!(bus.len(STREAM).await.expect("len"), 3);
}
