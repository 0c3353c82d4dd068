//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream**: `clinicflow:events`, one stream for every event
//! - **Consumer group**: `clinicflow.workers`, the logical work queue; each
//!   entry goes to one consumer of the group
//! - **Dead-letter stream**: `clinicflow:events:dlq`
//!
//! Entry fields are `event_id`, `event_type` and `payload` (the JSON
//! `DomainEvent`). Dead-letter entries add `reason`, `failed_at` and
//! `original_id` (the stream entry id).
//!
//! ## Redelivery
//!
//! An entry read with `XREADGROUP ... >` stays in the consumer's pending list
//! until `XACK`. On start the consumer first drains its own pending list
//! (`XREADGROUP ... 0`), so entries in flight during a crash are delivered
//! again, flagged `redelivered`.
//!
//! An entry whose `payload` is missing or does not decode never reaches a
//! handler. It goes straight to the dead-letter stream with its raw fields.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{debug, info, instrument, warn};

use clinicflow_events::{BusError, Delivery, DomainEvent, EventBus, MessageSource};

use crate::config::{DEFAULT_CONSUMER_GROUP, DEFAULT_DLQ_KEY, DEFAULT_STREAM_KEY};

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub url: String,
    pub stream_key: String,
    pub dlq_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
}

impl RedisStreamsConfig {
    pub fn new(url: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: consumer_name.into(),
        }
    }
}

/// Publisher and work-queue consumer over one Redis stream.
///
/// Blocking reads get their own connection so publishes and acks never queue
/// behind an `XREADGROUP ... BLOCK`.
#[derive(Clone)]
pub struct RedisStreamsEventBus {
    config: RedisStreamsConfig,
    writer: MultiplexedConnection,
    reader: MultiplexedConnection,
    draining_backlog: std::sync::Arc<AtomicBool>,
}

impl RedisStreamsEventBus {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: RedisStreamsConfig) -> Result<Self, BusError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| map_redis_error("open", e))?;
        let writer = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        let reader = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;

        let bus = Self {
            config,
            writer,
            reader,
            draining_backlog: std::sync::Arc::new(AtomicBool::new(true)),
        };
        bus.ensure_consumer_group().await?;
        info!(
            stream_key = %bus.config.stream_key,
            group = %bus.config.consumer_group,
            consumer = %bus.config.consumer_name,
            "connected to redis streams"
        );
        Ok(bus)
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    /// `XGROUP CREATE ... MKSTREAM`, tolerating an existing group.
    async fn ensure_consumer_group(&self) -> Result<(), BusError> {
        let mut conn = self.writer.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream_key, &self.config.consumer_group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    /// Read one entry. Entries that do not decode to a [`DomainEvent`] are
    /// dead-lettered on the spot and the read moves on to the next one, so
    /// a malformed entry can never pin the pending list.
    async fn read(&self, id: &str, block: Option<Duration>) -> Result<Option<Delivery>, BusError> {
        let mut options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(1);
        if let Some(block) = block {
            options = options.block(block.as_millis().max(1) as usize);
        }

        loop {
            let mut conn = self.reader.clone();
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&self.config.stream_key], &[id], &options)
                .await
                .map_err(|e| map_redis_error("XREADGROUP", e))?;

            let Some(entry) = reply.into_iter().flat_map(|r| r.keys).flat_map(|k| k.ids).next() else {
                return Ok(None);
            };

            let payload: Option<String> = entry.get("payload");
            match decode_payload(payload.as_deref()) {
                Ok(event) => {
                    return Ok(Some(Delivery {
                        tag: entry.id,
                        event,
                        redelivered: id != ">",
                    }));
                }
                Err(reason) => {
                    let fields = vec![
                        ("event_id", entry.get::<String>("event_id").unwrap_or_default()),
                        ("event_type", entry.get::<String>("event_type").unwrap_or_default()),
                        ("payload", payload.unwrap_or_default()),
                    ];
                    self.move_to_dlq(&entry.id, fields, &reason).await?;
                }
            }
        }
    }

    /// Copy an entry to the dead-letter stream and ack the original in one
    /// `MULTI`/`EXEC`, so the entry is never in both or neither.
    async fn move_to_dlq(&self, tag: &str, mut fields: Vec<(&str, String)>, reason: &str) -> Result<(), BusError> {
        fields.push(("reason", reason.to_string()));
        fields.push(("failed_at", chrono::Utc::now().to_rfc3339()));
        fields.push(("original_id", tag.to_string()));

        let mut conn = self.writer.clone();
        let _: () = redis::pipe()
            .atomic()
            .xadd(&self.config.dlq_key, "*", fields.as_slice())
            .ignore()
            .xack(&self.config.stream_key, &self.config.consumer_group, &[tag])
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("dead-letter", e))?;

        warn!(%tag, %reason, "message sent to dead-letter stream");
        Ok(())
    }
}

impl core::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("stream_key", &self.config.stream_key)
            .field("consumer_group", &self.config.consumer_group)
            .field("consumer_name", &self.config.consumer_name)
            .finish()
    }
}

#[async_trait]
impl EventBus for RedisStreamsEventBus {
    #[instrument(
        skip(self, event),
        fields(stream_key = %self.config.stream_key, event_id = %event.event_id(), event_type = event.event_type()),
        err
    )]
    async fn publish(&self, event: &DomainEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.writer.clone();
        let _: String = conn
            .xadd(
                &self.config.stream_key,
                "*",
                &[
                    ("event_id", event.event_id().to_string()),
                    ("event_type", event.event_type().to_string()),
                    ("payload", payload),
                ],
            )
            .await
            .map_err(|e| map_redis_error("XADD", e))?;
        Ok(())
    }
}

#[async_trait]
impl MessageSource for RedisStreamsEventBus {
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        if self.draining_backlog.load(Ordering::Acquire) {
            if let Some(delivery) = self.read("0", None).await? {
                debug!(tag = %delivery.tag, "redelivering pending entry");
                return Ok(Some(delivery));
            }
            self.draining_backlog.store(false, Ordering::Release);
        }
        self.read(">", Some(wait)).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut conn = self.writer.clone();
        let _: u64 = conn
            .xack(&self.config.stream_key, &self.config.consumer_group, &[&delivery.tag])
            .await
            .map_err(|e| map_redis_error("XACK", e))?;
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(tag = %delivery.tag, event_id = %delivery.event.event_id()), err)]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        let fields = vec![
            ("event_id", delivery.event.event_id().to_string()),
            ("event_type", delivery.event.event_type().to_string()),
            ("payload", serde_json::to_string(&delivery.event)?),
        ];
        self.move_to_dlq(&delivery.tag, fields, reason).await
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> BusError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BusError::Unavailable(format!("{operation}: {err}"))
    } else {
        BusError::Transport(format!("{operation} failed: {err}"))
    }
}

fn decode_payload(payload: Option<&str>) -> Result<DomainEvent, String> {
    let payload = payload.ok_or_else(|| "entry has no payload".to_string())?;
    serde_json::from_str(payload).map_err(|e| format!("undecodable payload: {e}"))
}
