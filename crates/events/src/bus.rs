//! Event publishing/consumption abstraction (mechanics only).
//!
//! Events are stored first, then published. The bus is for distribution,
//! not storage: the event store stays the source of truth, and anything
//! that fails to publish can be republished from it.
//!
//! Delivery is **at-least-once**. A single logical queue carries every event;
//! a consumer takes a [`Delivery`], fans it out to its handlers, then either
//! acks it or moves it to the dead-letter queue. Handlers must be idempotent.
//!
//! ```text
//! Command → Event Store (append) → EventBus::publish → queue
//!                                                        │
//!                         MessageSource::next_delivery ◄─┘
//!                                   │
//!                       handlers ───┴── ack | dead_letter
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::DomainEvent;

#[derive(Debug, Error)]
pub enum BusError {
    /// The broker cannot be reached right now.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other transport-level failure.
    #[error("event bus transport error: {0}")]
    Transport(String),
}

/// Publishing side of the bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), BusError>;

    /// Publish in order, stopping at the first failure.
    async fn publish_many(&self, events: &[DomainEvent]) -> Result<(), BusError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, event: &DomainEvent) -> Result<(), BusError> {
        (**self).publish(event).await
    }

    async fn publish_many(&self, events: &[DomainEvent]) -> Result<(), BusError> {
        (**self).publish_many(events).await
    }
}

/// One message handed to a consumer, pending ack.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport-specific handle used to ack or dead-letter this message.
    pub tag: String,
    pub event: DomainEvent,
    /// Set when the message was handed out before without being settled.
    pub redelivered: bool,
}

/// Consuming side of the bus: the work queue.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait up to `wait` for the next message. `Ok(None)` on timeout.
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BusError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Remove the message from the queue and park it in the dead-letter queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError>;
}

#[async_trait]
impl<S> MessageSource for Arc<S>
where
    S: MessageSource + ?Sized,
{
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        (**self).next_delivery(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        (**self).ack(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        (**self).dead_letter(delivery, reason).await
    }
}
