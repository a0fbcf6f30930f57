//! In-memory stream bus with consumer-group semantics.
//!
//! Each stream is an ordered map of entries. A consumer group tracks the
//! last id it delivered and a pending-entry index (owner, delivery time,
//! delivery count) that serves as the visibility timeout for redelivery.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use order_gateway_core::config::StreamConfig;
use order_gateway_core::environment::{Clock, SystemClock};
use order_gateway_core::stream::{EventId, StreamEvent, StreamMessage};
use order_gateway_core::stream_bus::{StreamBus, StreamBusError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: Option<EventId>,
    pending: BTreeMap<EventId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EventId, String>,
    last_id: Option<EventId>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn event(name: &str, id: EventId, payload: &str, delivery_count: u32) -> StreamEvent {
        StreamEvent {
            stream: name.to_string(),
            id,
            payload: payload.to_string(),
            delivery_count,
        }
    }

    fn evict_older_than(&mut self, min_millis: u64) -> u64 {
        let keep = self.entries.split_off(&EventId::new(min_millis, 0));
        let evicted = self.entries.len() as u64;
        self.entries = keep;
        evicted
    }

    fn evict_beyond(&mut self, max_len: u64) {
        while self.entries.len() as u64 > max_len {
            self.entries.pop_first();
        }
    }
}

/// [`StreamBus`] held in process memory.
///
/// Entry ids are derived from the injected clock, so retention follows the
/// same clock as the rest of a test. Blocking reads wake up as soon as an
/// entry is appended.
///
/// # Example
///
/// ```
/// use order_gateway_testing::InMemoryStreamBus;
/// use order_gateway_core::config::StreamConfig;
/// use order_gateway_core::stream_bus::StreamBus;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryStreamBus::new(StreamConfig::default());
/// bus.ensure_group("orders:main", "workers").await?;
/// bus.append("orders:main", "{}".to_string()).await?;
///
/// let batch = bus
///     .read_group("orders:main", "workers", "w-0", 10, Duration::ZERO)
///     .await?;
/// assert_eq!(batch.len(), 1);
/// assert_eq!(bus.pending_count("orders:main", "workers").await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryStreamBus {
    config: StreamConfig,
    clock: Arc<dyn Clock>,
    streams: Arc<Mutex<HashMap<String, Stream>>>,
    appended: Arc<Notify>,
    broken: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for InMemoryStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStreamBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InMemoryStreamBus {
    /// Create a bus on the system clock.
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a bus whose ids and retention follow `clock`.
    #[must_use]
    pub fn with_clock(config: StreamConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            streams: Arc::new(Mutex::new(HashMap::new())),
            appended: Arc::new(Notify::new()),
            broken: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Make every append to `stream` fail with `PublishFailed` until
    /// [`InMemoryStreamBus::restore_appends`] is called.
    pub fn fail_appends(&self, stream: &str) {
        self.broken.lock().unwrap().insert(stream.to_string());
    }

    /// Undo [`InMemoryStreamBus::fail_appends`].
    pub fn restore_appends(&self, stream: &str) {
        self.broken.lock().unwrap().remove(stream);
    }

    /// Decoded messages currently in `stream`, oldest first.
    ///
    /// Entries that do not decode are skipped.
    #[must_use]
    pub fn messages(&self, stream: &str) -> Vec<StreamMessage> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| {
                s.entries
                    .values()
                    .filter_map(|payload| StreamMessage::from_payload(payload).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw payloads currently in `stream`, oldest first.
    #[must_use]
    pub fn payloads(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0)
    }

    fn retention_floor(&self) -> Option<u64> {
        let retention = self.config.retention();
        if retention.is_zero() {
            return None;
        }
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        Some(self.now_millis().saturating_sub(retention_ms))
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEvent>, StreamBusError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamBusError::ConsumerGroupError(format!("no stream '{stream}'")))?;
        let Stream { entries, groups, .. } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StreamBusError::ConsumerGroupError(format!("no group '{group}' on '{stream}'")))?;

        let fresh: Vec<(EventId, String)> = match group_state.last_delivered {
            Some(last) => entries.range(last.next()..),
            None => entries.range(..),
        }
        .take(count)
        .map(|(id, payload)| (*id, payload.clone()))
        .collect();

        let now = Instant::now();
        let mut batch = Vec::with_capacity(fresh.len());
        for (id, payload) in fresh {
            group_state.last_delivered = Some(id);
            group_state.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            batch.push(Stream::event(stream, id, &payload, 1));
        }
        Ok(batch)
    }
}

impl StreamBus for InMemoryStreamBus {
    fn ensure_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut streams = self.streams.lock().unwrap();
            streams
                .entry(stream)
                .or_default()
                .groups
                .entry(group)
                .or_default();
            Ok(())
        })
    }

    fn append(
        &self,
        stream: &str,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<EventId, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        Box::pin(async move {
            if self.broken.lock().unwrap().contains(&stream) {
                return Err(StreamBusError::PublishFailed {
                    stream,
                    reason: "appends disabled".to_string(),
                });
            }
            let millis = self.now_millis();
            let floor = self.retention_floor();
            let id = {
                let mut streams = self.streams.lock().unwrap();
                let state = streams.entry(stream).or_default();
                let id = match state.last_id {
                    Some(last) if last.millis() >= millis => last.next(),
                    _ => EventId::new(millis, 0),
                };
                state.entries.insert(id, payload);
                state.last_id = Some(id);
                if self.config.max_len > 0 {
                    state.evict_beyond(self.config.max_len);
                }
                if let Some(floor) = floor {
                    state.evict_older_than(floor);
                }
                id
            };
            self.appended.notify_waiters();
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
                // Register interest before checking, so an append between the
                // check and the wait is not missed.
                let appended = self.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                let batch = self.try_read(&stream, &group, &consumer, count)?;
                if !batch.is_empty() || block.is_zero() {
                    return Ok(batch);
                }
                if tokio::time::timeout_at(deadline, appended).await.is_err() {
                    return Ok(Vec::new());
                }
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
            let mut streams = self.streams.lock().unwrap();
            let state = streams
                .get_mut(&stream)
                .ok_or_else(|| StreamBusError::ConsumerGroupError(format!("no stream '{stream}'")))?;
            let Stream { entries, groups, .. } = state;
            let group_state = groups.get_mut(&group).ok_or_else(|| {
                StreamBusError::ConsumerGroupError(format!("no group '{group}' on '{stream}'"))
            })?;

            let now = Instant::now();
            let idle: Vec<EventId> = group_state
                .pending
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
                .map(|(id, _)| *id)
                .collect();

            let mut claimed = Vec::new();
            for id in idle {
                if claimed.len() >= count {
                    break;
                }
                let Some(payload) = entries.get(&id) else {
                    // Trimmed away while pending.
                    group_state.pending.remove(&id);
                    continue;
                };
                if let Some(pending) = group_state.pending.get_mut(&id) {
                    pending.consumer.clone_from(&consumer);
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(Stream::event(&stream, id, payload, pending.deliveries));
                }
            }
            Ok(claimed)
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
            let mut streams = self.streams.lock().unwrap();
            let removed = streams
                .get_mut(&stream)
                .and_then(|s| s.groups.get_mut(&group))
                .and_then(|g| g.pending.remove(&id));
            Ok(removed.is_some())
        })
    }

    fn len(&self, stream: &str) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        Box::pin(async move {
            let streams = self.streams.lock().unwrap();
            Ok(streams.get(&stream).map_or(0, |s| s.entries.len() as u64))
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
            let streams = self.streams.lock().unwrap();
            Ok(streams
                .get(&stream)
                .and_then(|s| s.groups.get(&group))
                .map_or(0, |g| g.pending.len() as u64))
        })
    }

    fn range(
        &self,
        stream: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEvent>, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        Box::pin(async move {
            let streams = self.streams.lock().unwrap();
            Ok(streams
                .get(&stream)
                .map(|s| {
                    s.entries
                        .iter()
                        .take(limit)
                        .map(|(id, payload)| Stream::event(&stream, *id, payload, 0))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn trim(&self, stream: &str) -> Pin<Box<dyn Future<Output = Result<u64, StreamBusError>> + Send + '_>> {
        let stream = stream.to_string();
        Box::pin(async move {
            let Some(floor) = self.retention_floor() else {
                return Ok(0);
            };
            let mut streams = self.streams.lock().unwrap();
            Ok(streams
                .get_mut(&stream)
                .map_or(0, |s| s.evict_older_than(floor)))
        })
    }
}
