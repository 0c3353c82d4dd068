//! In-memory event bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::bus::{BusError, Delivery, EventBus, MessageSource};
use crate::envelope::DomainEvent;

/// A message that was rejected by a consumer.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: DomainEvent,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_tag: u64,
    ready: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory work queue with ack and dead-lettering.
///
/// - No IO
/// - FIFO, one logical queue
/// - At-least-once: unacked messages can be put back with
///   [`InMemoryEventBus::requeue_in_flight`] (simulated consumer crash)
/// - [`InMemoryEventBus::set_available`] simulates a broker outage; while
///   off, publishing, reading and settling all fail
#[derive(Debug)]
pub struct InMemoryEventBus {
    state: Mutex<QueueState>,
    notify: Notify,
    available: AtomicBool,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Messages waiting to be handed out.
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages handed out but not yet acked or dead-lettered.
    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().map(|s| s.dead_letters.clone()).unwrap_or_default()
    }

    /// Put every unsettled message back at the head of the queue, flagged as
    /// redelivered.
    pub fn requeue_in_flight(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let mut unsettled: Vec<Delivery> = state.in_flight.drain().map(|(_, d)| d).collect();
        unsettled.sort_by(|a, b| b.tag.cmp(&a.tag));

        let count = unsettled.len();
        for mut delivery in unsettled {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
        }
        drop(state);

        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Transport("in-memory bus lock poisoned".to_string()))
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory bus switched off".to_string()))
        }
    }

    fn try_take(&self) -> Result<Option<Delivery>, BusError> {
        let mut state = self.lock()?;
        let Some(delivery) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.in_flight.insert(delivery.tag.clone(), delivery.clone());
        Ok(Some(delivery))
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &DomainEvent) -> Result<(), BusError> {
        self.ensure_available()?;
        {
            let mut state = self.lock()?;
            state.next_tag += 1;
            // Zero-padded so tags sort in publish order.
            let tag = format!("{:020}", state.next_tag);
            state.ready.push_back(Delivery {
                tag,
                event: event.clone(),
                redelivered: false,
            });
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryEventBus {
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        self.ensure_available()?;
        if let Some(delivery) = self.try_take()? {
            return Ok(Some(delivery));
        }

        if tokio::time::timeout(wait, self.notify.notified()).await.is_err() {
            return Ok(None);
        }

        self.ensure_available()?;
        self.try_take()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        if state.in_flight.remove(&delivery.tag).is_none() {
            tracing::debug!(tag = %delivery.tag, "ack for unknown delivery ignored");
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        self.ensure_available()?;
        let mut state = self.lock()?;
        state.in_flight.remove(&delivery.tag);
        state.dead_letters.push(DeadLetter {
            event: delivery.event.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicflow_core::{AggregateId, CorrelationId, TenantId};
    use uuid::Uuid;

    use crate::envelope::{EventEnvelope, EventHeader};

    fn test_event(event_type: &str) -> DomainEvent {
        EventEnvelope::new(
            EventHeader {
                event_id: Uuid::now_v7(),
                event_type: event_type.to_string(),
                aggregate_type: "Test".to_string(),
                aggregate_id: AggregateId::new(),
                aggregate_version: 1,
                tenant_id: TenantId::new(),
                clinic_id: None,
                correlation_id: CorrelationId::new(),
                causation_id: None,
                user_id: None,
                created_at: Utc::now(),
                metadata: None,
            },
            serde_json::json!({}),
        )
    }

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = InMemoryEventBus::new();
        bus.publish(&test_event("First")).await.unwrap();
        bus.publish(&test_event("Second")).await.unwrap();

        let first = bus.next_delivery(WAIT).await.unwrap().expect("first");
        let second = bus.next_delivery(WAIT).await.unwrap().expect("second");

        assert_eq!(first.event.event_type(), "First");
        assert_eq!(second.event.event_type(), "Second");
        assert!(bus.next_delivery(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_settles_and_requeue_redelivers_unacked() {
        let bus = InMemoryEventBus::new();
        bus.publish(&test_event("A")).await.unwrap();
        bus.publish(&test_event("B")).await.unwrap();

        let a = bus.next_delivery(WAIT).await.unwrap().unwrap();
        let b = bus.next_delivery(WAIT).await.unwrap().unwrap();
        bus.ack(&a).await.unwrap();
        assert_eq!(bus.in_flight(), 1);

        assert_eq!(bus.requeue_in_flight(), 1);
        let again = bus.next_delivery(WAIT).await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.event.event_id(), b.event.event_id());
    }

    #[tokio::test]
    async fn dead_letter_moves_message_out_of_queue() {
        let bus = InMemoryEventBus::new();
        bus.publish(&test_event("Broken")).await.unwrap();

        let d = bus.next_delivery(WAIT).await.unwrap().unwrap();
        bus.dead_letter(&d, "handler exploded").await.unwrap();

        assert_eq!(bus.in_flight(), 0);
        assert_eq!(bus.pending(), 0);
        let dlq = bus.dead_letters();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "handler exploded");
        assert_eq!(dlq[0].event.event_id(), d.event.event_id());
    }

    #[tokio::test]
    async fn outage_fails_publish_and_consume() {
        let bus = InMemoryEventBus::new();
        bus.set_available(false);

        assert!(matches!(bus.publish(&test_event("X")).await, Err(BusError::Unavailable(_))));
        assert!(matches!(bus.next_delivery(WAIT).await, Err(BusError::Unavailable(_))));

        bus.set_available(true);
        bus.publish(&test_event("X")).await.unwrap();
        let d = bus.next_delivery(WAIT).await.unwrap().unwrap();

        bus.set_available(false);
        assert!(matches!(bus.ack(&d).await, Err(BusError::Unavailable(_))));
        assert!(matches!(bus.dead_letter(&d, "x").await, Err(BusError::Unavailable(_))));
        assert_eq!(bus.in_flight(), 1);

        bus.set_available(true);
        bus.ack(&d).await.unwrap();
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let bus = std::sync::Arc::new(InMemoryEventBus::new());
        let consumer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.next_delivery(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(&test_event("Late")).await.unwrap();

        let delivered = consumer.await.unwrap().unwrap().expect("woken by publish");
        assert_eq!(delivered.event.event_type(), "Late");
    }
}
