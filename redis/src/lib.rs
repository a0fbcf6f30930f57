//! Redis Streams implementation of the [`StreamBus`] trait.
//!
//! Each logical stream is one Redis stream key. Work items are stored in a
//! single `payload` field holding the JSON-encoded
//! [`StreamMessage`](order_gateway_core::stream::StreamMessage).
//!
//! # Command Mapping
//!
//! | Operation       | Redis command                                   |
//! |-----------------|-------------------------------------------------|
//! | `ensure_group`  | `XGROUP CREATE <stream> <group> 0 MKSTREAM`     |
//! | `append`        | `XADD <stream> MAXLEN ~ <n> * payload <json>`   |
//! | `read_group`    | `XREADGROUP GROUP <group> <consumer> COUNT n`   |
//! | `claim_stale`   | `XAUTOCLAIM` + `XPENDING` for delivery counts   |
//! | `ack`           | `XACK`                                          |
//! | `len`           | `XLEN`                                          |
//! | `pending_count` | `XPENDING <stream> <group>`                     |
//! | `range`         | `XRANGE <stream> - + COUNT n`                   |
//! | `trim`          | `XTRIM <stream> MINID ~ <now - retention>`      |
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: entries stay in the group's pending-entry list until
//!   `XACK`. A crashed consumer's entries are reclaimed with `XAUTOCLAIM`.
//! - **Approximate trimming**: `MAXLEN ~` and `MINID ~` let Redis trim whole
//!   macro nodes, so a stream may hold slightly more than the bound.
//!
//! # Blocking Reads
//!
//! All calls share one multiplexed [`ConnectionManager`]. A server-side
//! `BLOCK` would stall every other command on that connection, so
//! `read_group` polls with a short interval until the block window ends.
//!
//! # Requirements
//!
//! Redis 6.2 or later (`XAUTOCLAIM`, `XTRIM MINID`).
//!
//! # Example
//!
//! ```no_run
//! use order_gateway_core::config::StreamConfig;
//! use order_gateway_core::stream_bus::StreamBus;
//! use order_gateway_redis::RedisStreamBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamConfig::default();
//! let bus = RedisStreamBus::new("redis://127.0.0.1:6379", config.clone()).await?;
//! bus.ensure_group(&config.main_stream, &config.consumer_group).await?;
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use order_gateway_core::config::StreamConfig;
use order_gateway_core::stream::{EventId, StreamEvent};
use order_gateway_core::stream_bus::{StreamBus, StreamBusError};
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamRangeReply, StreamReadReply};
use redis::{Client, RedisError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Field holding the encoded message in every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// Interval between non-blocking reads while waiting for new entries.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Redis Streams-backed stream bus.
///
/// Cheap to clone; clones share the underlying connection manager.
#[derive(Clone)]
pub struct RedisStreamBus {
    /// Connection manager for connection pooling and reconnects.
    conn_manager: ConnectionManager,
    /// Retention limits applied on append and trim.
    config: StreamConfig,
}

impl RedisStreamBus {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `config` - Stream names and retention limits
    ///
    /// # Errors
    ///
    /// Returns [`StreamBusError::ConnectionFailed`] if the client cannot be
    /// created or the first connection fails.
    pub async fn new(redis_url: &str, config: StreamConfig) -> Result<Self, StreamBusError> {
        let client = Client::open(redis_url).map_err(|e| {
            StreamBusError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StreamBusError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        Ok(Self {
            conn_manager,
            config,
        })
    }

    /// Round-trip a `PING` to the server.
    ///
    /// # Errors
    ///
    /// Returns [`StreamBusError::TransportError`] if Redis does not answer.
    pub async fn ping(&self) -> Result<(), StreamBusError> {
        let mut conn = self.conn_manager.clone();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StreamBusError::TransportError(format!("Redis ping failed: {e}")))?;
        Ok(())
    }

    /// The retention limits this bus was built with.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEvent>, StreamBusError> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| group_or_read_error(stream, group, &e))?;

        let entries = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids);

        entries.map(|entry| to_event(stream, &entry, 1)).collect()
    }

    /// Delivery count of each claimed entry, one exact-range `XPENDING`
    /// per id in a single pipeline.
    ///
    /// A range query spanning first..last would also return entries that
    /// sit between them in the pending list and could cut the claimed ones
    /// off at `COUNT`.
    async fn delivery_counts(
        &self,
        stream: &str,
        group: &str,
        claimed: &[StreamId],
    ) -> Result<HashMap<String, u32>, StreamBusError> {
        if claimed.is_empty() {
            return Ok(HashMap::new());
        }

        let mut pipe = redis::pipe();
        for entry in claimed {
            pipe.cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg(&entry.id)
                .arg(&entry.id)
                .arg(1);
        }

        let mut conn = self.conn_manager.clone();
        let replies: Vec<Vec<(String, String, u64, u32)>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| group_or_read_error(stream, group, &e))?;

        Ok(replies
            .into_iter()
            .flatten()
            .map(|(id, _consumer, _idle, delivered)| (id, delivered))
            .collect())
    }
}

fn to_event(stream: &str, entry: &StreamId, delivery_count: u32) -> Result<StreamEvent, StreamBusError> {
    let id = entry
        .id
        .parse::<EventId>()
        .map_err(|e| StreamBusError::ReadFailed {
            stream: stream.to_string(),
            reason: e.to_string(),
        })?;

    Ok(StreamEvent {
        stream: stream.to_string(),
        id,
        payload: entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default(),
        delivery_count,
    })
}

fn is_no_group(e: &RedisError) -> bool {
    e.code() == Some("NOGROUP")
}

fn group_or_read_error(stream: &str, group: &str, e: &RedisError) -> StreamBusError {
    if is_no_group(e) {
        StreamBusError::ConsumerGroupError(format!("Group '{group}' missing on '{stream}': {e}"))
    } else {
        StreamBusError::ReadFailed {
            stream: stream.to_string(),
            reason: e.to_string(),
        }
    }
}

impl StreamBus for RedisStreamBus {
    fn ensure_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let created: Result<(), RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream)
                .arg(&group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match created {
                Ok(()) => {
                    debug!(stream = %stream, group = %group, "Consumer group created");
                    Ok(())
                }
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(StreamBusError::ConsumerGroupError(format!(
                    "Failed to create group '{group}' on '{stream}': {e}"
                ))),
            }
        })
    }

    fn append(
        &self,
        stream: &str,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<EventId, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let mut cmd = redis::cmd("XADD");
            cmd.arg(&stream);
            if self.config.max_len > 0 {
                cmd.arg("MAXLEN");
                if self.config.approximate_trimming {
                    cmd.arg("~");
                }
                cmd.arg(self.config.max_len);
            }
            cmd.arg("*").arg(PAYLOAD_FIELD).arg(payload);

            let raw: String = cmd.query_async(&mut conn).await.map_err(|e| {
                StreamBusError::PublishFailed {
                    stream: stream.clone(),
                    reason: e.to_string(),
                }
            })?;

            let id = raw.parse::<EventId>().map_err(|e| StreamBusError::PublishFailed {
                stream: stream.clone(),
                reason: e.to_string(),
            })?;
            trace!(stream = %stream, event_id = %id, "Entry appended");
            Ok(id)
        })
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();

        Box::pin(async move {
            let deadline = Instant::now() + block;
            loop {
                let events = self.read_new(&stream, &group, &consumer, count).await?;
                let now = Instant::now();
                if !events.is_empty() || now >= deadline {
                    return Ok(events);
                }
                tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
            }
        })
    }

    fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

            // [next-cursor, [entries...], [deleted ids...]]
            let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
                .arg(&stream)
                .arg(&group)
                .arg(&consumer)
                .arg(min_idle_ms)
                .arg("0-0")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
                .map_err(|e| group_or_read_error(&stream, &group, &e))?;

            let claimed: Vec<StreamId> = match reply.get(1) {
                Some(value) => redis::from_redis_value::<StreamClaimReply>(value)
                    .map(|reply| reply.ids)
                    .map_err(|e| StreamBusError::ReadFailed {
                        stream: stream.clone(),
                        reason: format!("Unexpected XAUTOCLAIM reply: {e}"),
                    })?,
                None => Vec::new(),
            };
            if claimed.is_empty() {
                return Ok(Vec::new());
            }

            let counts = self.delivery_counts(&stream, &group, &claimed).await?;
            let events = claimed
                .iter()
                .map(|entry| {
                    let delivered = counts.get(&entry.id).copied().unwrap_or(2);
                    to_event(&stream, entry, delivered)
                })
                .collect::<Result<Vec<_>, _>>()?;

            debug!(
                stream = %stream,
                consumer = %consumer,
                count = events.len(),
                "Claimed stale pending entries"
            );
            Ok(events)
        })
    }

    fn ack(
        &self,
        stream: &str,
        group: &str,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let acked: u64 = redis::cmd("XACK")
                .arg(&stream)
                .arg(&group)
                .arg(id.to_string())
                .query_async(&mut conn)
                .await
                .map_err(|e| StreamBusError::TransportError(format!("XACK failed on '{stream}': {e}")))?;
            Ok(acked > 0)
        })
    }

    fn len(&self, stream: &str) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            redis::cmd("XLEN")
                .arg(&stream)
                .query_async(&mut conn)
                .await
                .map_err(|e| StreamBusError::ReadFailed {
                    stream: stream.clone(),
                    reason: e.to_string(),
                })
        })
    }

    fn pending_count(
        &self,
        stream: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            // [count, smallest id, greatest id, [[consumer, count]...]]
            let summary: Result<Vec<redis::Value>, RedisError> = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(&group)
                .query_async(&mut conn)
                .await;

            let summary = match summary {
                Ok(summary) => summary,
                Err(e) if is_no_group(&e) => return Ok(0),
                Err(e) => {
                    return Err(StreamBusError::ReadFailed {
                        stream: stream.clone(),
                        reason: e.to_string(),
                    });
                }
            };

            match summary.first() {
                Some(count) => redis::from_redis_value(count).map_err(|e| StreamBusError::ReadFailed {
                    stream: stream.clone(),
                    reason: format!("Unexpected XPENDING reply: {e}"),
                }),
                None => Ok(0),
            }
        })
    }

    fn range(
        &self,
        stream: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let entries: Vec<StreamId> = redis::cmd("XRANGE")
                .arg(&stream)
                .arg("-")
                .arg("+")
                .arg("COUNT")
                .arg(limit)
                .query_async::<StreamRangeReply>(&mut conn)
                .await
                .map(|reply| reply.ids)
                .map_err(|e| StreamBusError::ReadFailed {
                    stream: stream.clone(),
                    reason: e.to_string(),
                })?;

            entries.iter().map(|entry| to_event(&stream, entry, 0)).collect()
        })
    }

    fn trim(&self, stream: &str) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();

        Box::pin(async move {
            let retention = self.config.retention();
            if retention.is_zero() {
                return Ok(0);
            }
            let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
            let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
            let min_id = EventId::new(now_ms.saturating_sub(retention_ms), 0);

            let mut conn = self.conn_manager.clone();
            let mut cmd = redis::cmd("XTRIM");
            cmd.arg(&stream).arg("MINID");
            if self.config.approximate_trimming {
                cmd.arg("~");
            }
            cmd.arg(min_id.to_string());

            let evicted: u64 = cmd.query_async(&mut conn).await.map_err(|e| {
                StreamBusError::TransportError(format!("XTRIM failed on '{stream}': {e}"))
            })?;
            debug!(stream = %stream, min_id = %min_id, evicted, "Stream trimmed");
            Ok(evicted)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redis_stream_bus_is_send_sync() {
        fn _is_send_sync<T: Send + Sync>() {}
        _is_send_sync::<RedisStreamBus>();
    }

    #[test]
    fn missing_payload_field_decodes_as_empty() {
        let entry = StreamId {
            id: "1700000000000-0".to_string(),
            map: HashMap::new(),
        };
        let event = to_event("orders:main", &entry, 1).unwrap();
        assert_eq!(event.id, EventId::new(1_700_000_000_000, 0));
        assert!(event.payload.is_empty());
        assert!(event.message().is_err());
    }

    #[test]
    fn malformed_entry_id_is_a_read_error() {
        let entry = StreamId {
            id: "not-an-id".to_string(),
            map: HashMap::new(),
        };
        assert!(matches!(
            to_event("orders:main", &entry, 1),
            Err(StreamBusError::ReadFailed { .. })
        ));
    }
}
