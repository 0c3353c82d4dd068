//! Event-sourcing buffer and replay for aggregates.
//!
//! Aggregates carry an [`EventLog`]: their stream revision plus the events
//! recorded since the last successful append. Commands call
//! [`EventSourced::record`], which stamps the next version, applies the event
//! and buffers it. Rehydration goes through [`EventSourced::load_from_history`]
//! (typed) or [`EventSourced::load_from_domain_events`] (raw store rows).

use thiserror::Error;
use uuid::Uuid;

use clinicflow_core::{Aggregate, AggregateId};

use crate::context::EventContext;
use crate::envelope::{DomainEvent, EventEnvelope};
use crate::event::Event;

/// Stream revision plus uncommitted events.
#[derive(Debug, Clone)]
pub struct EventLog<E> {
    version: u64,
    pending: Vec<EventEnvelope<E>>,
}

impl<E> Default for EventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventLog<E> {
    pub fn new() -> Self {
        Self {
            version: 0,
            pending: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending(&self) -> &[EventEnvelope<E>] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<EventEnvelope<E>> {
        std::mem::take(&mut self.pending)
    }

    fn push(&mut self, event: EventEnvelope<E>) {
        self.version = event.aggregate_version();
        self.pending.push(event);
    }

    fn advance_to(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event {event_id} belongs to {aggregate_type}/{aggregate_id}")]
    ForeignEvent {
        event_id: Uuid,
        aggregate_type: String,
        aggregate_id: AggregateId,
    },

    #[error("non-contiguous history: expected version {expected}, found {found}")]
    VersionGap { expected: u64, found: u64 },

    #[error("failed to decode event {event_id}: {source}")]
    Decode {
        event_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot replay into an aggregate with {0} uncommitted event(s)")]
    PendingChanges(usize),
}

/// An aggregate whose state is derived from its own event stream.
pub trait EventSourced: Aggregate<Event: Event> + Sized {
    fn aggregate_id(&self) -> AggregateId;

    fn event_log(&self) -> &EventLog<Self::Event>;

    fn event_log_mut(&mut self) -> &mut EventLog<Self::Event>;

    /// Events recorded since the last append, oldest first.
    fn uncommitted(&self) -> &[EventEnvelope<Self::Event>] {
        self.event_log().pending()
    }

    /// Hand the uncommitted events over to the store.
    fn take_uncommitted(&mut self) -> Vec<EventEnvelope<Self::Event>> {
        self.event_log_mut().take_pending()
    }

    /// Stamp `event` with the next version, apply it and buffer it.
    fn record(&mut self, ctx: &EventContext, event: Self::Event) {
        let version = self.event_log().version() + 1;
        let envelope = EventEnvelope::record(ctx, Self::AGGREGATE_TYPE, self.aggregate_id(), version, event);
        self.apply(envelope.event_data());
        self.event_log_mut().push(envelope);
    }

    /// Rebuild state from typed history.
    ///
    /// Events are replayed in ascending `aggregate_version` order and must
    /// continue the current revision without gaps. Nothing is buffered.
    fn load_from_history<I>(&mut self, history: I) -> Result<(), ReplayError>
    where
        I: IntoIterator<Item = EventEnvelope<Self::Event>>,
    {
        ensure_clean(self)?;

        let mut history: Vec<_> = history.into_iter().collect();
        history.sort_by_key(|e| e.aggregate_version());

        for envelope in &history {
            check_next(self, envelope)?;
            self.apply(envelope.event_data());
            self.event_log_mut().advance_to(envelope.aggregate_version());
        }
        Ok(())
    }

    /// Rebuild state from raw store rows.
    ///
    /// Rows whose `event_type` this aggregate does not know still advance the
    /// version so later appends do not collide with them.
    fn load_from_domain_events(&mut self, history: &[DomainEvent]) -> Result<(), ReplayError> {
        ensure_clean(self)?;

        let mut ordered: Vec<&DomainEvent> = history.iter().collect();
        ordered.sort_by_key(|e| e.aggregate_version());

        for raw in ordered {
            check_next(self, raw)?;
            let decoded = raw.decode::<Self::Event>().map_err(|source| ReplayError::Decode {
                event_id: raw.event_id(),
                source,
            })?;
            if let Some(envelope) = decoded {
                self.apply(envelope.event_data());
            }
            self.event_log_mut().advance_to(raw.aggregate_version());
        }
        Ok(())
    }
}

fn ensure_clean<A: EventSourced>(aggregate: &A) -> Result<(), ReplayError> {
    match aggregate.uncommitted().len() {
        0 => Ok(()),
        n => Err(ReplayError::PendingChanges(n)),
    }
}

fn check_next<A: EventSourced, P>(aggregate: &A, envelope: &EventEnvelope<P>) -> Result<(), ReplayError> {
    if envelope.aggregate_type() != A::AGGREGATE_TYPE || envelope.aggregate_id() != aggregate.aggregate_id() {
        return Err(ReplayError::ForeignEvent {
            event_id: envelope.event_id(),
            aggregate_type: envelope.aggregate_type().to_string(),
            aggregate_id: envelope.aggregate_id(),
        });
    }

    let expected = aggregate.event_log().version() + 1;
    if envelope.aggregate_version() != expected {
        return Err(ReplayError::VersionGap {
            expected,
            found: envelope.aggregate_version(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicflow_core::{AggregateRoot, TenantId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Added {
        amount: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "event_type", content = "event_data")]
    enum CounterEvent {
        Added(Added),
    }

    impl Event for CounterEvent {
        const EVENT_TYPES: &'static [&'static str] = &["Added"];

        fn event_type(&self) -> &'static str {
            "Added"
        }
    }

    #[derive(Debug, Clone)]
    struct Counter {
        id: AggregateId,
        total: i64,
        log: EventLog<CounterEvent>,
    }

    impl Counter {
        fn empty(id: AggregateId) -> Self {
            Self {
                id,
                total: 0,
                log: EventLog::new(),
            }
        }

        fn add(&mut self, ctx: &EventContext, amount: i64) {
            self.record(ctx, CounterEvent::Added(Added { amount }));
        }
    }

    impl AggregateRoot for Counter {
        type Id = AggregateId;

        fn id(&self) -> &Self::Id {
            &self.id
        }

        fn version(&self) -> u64 {
            self.log.version()
        }
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "Counter";
        type Event = CounterEvent;

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Added(e) => self.total += e.amount,
            }
        }
    }

    impl EventSourced for Counter {
        fn aggregate_id(&self) -> AggregateId {
            self.id
        }

        fn event_log(&self) -> &EventLog<CounterEvent> {
            &self.log
        }

        fn event_log_mut(&mut self) -> &mut EventLog<CounterEvent> {
            &mut self.log
        }
    }

    fn ctx() -> EventContext {
        EventContext::new(TenantId::new())
    }

    #[test]
    fn record_stamps_contiguous_versions() {
        let ctx = ctx();
        let mut counter = Counter::empty(AggregateId::new());
        counter.add(&ctx, 2);
        counter.add(&ctx, 3);

        let versions: Vec<u64> = counter.uncommitted().iter().map(|e| e.aggregate_version()).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(counter.version(), 2);
        assert_eq!(counter.total, 5);

        let taken = counter.take_uncommitted();
        assert_eq!(taken.len(), 2);
        assert!(counter.uncommitted().is_empty());
        assert_eq!(counter.version(), 2);
    }

    #[test]
    fn replay_sorts_and_matches_incremental_state() {
        let ctx = ctx();
        let id = AggregateId::new();
        let mut live = Counter::empty(id);
        live.add(&ctx, 4);
        live.add(&ctx, -1);
        live.add(&ctx, 10);
        let mut history = live.take_uncommitted();
        history.reverse();

        let mut replayed = Counter::empty(id);
        replayed.load_from_history(history).unwrap();

        assert_eq!(replayed.total, live.total);
        assert_eq!(replayed.version(), 3);
        assert!(replayed.uncommitted().is_empty());
    }

    #[test]
    fn replay_rejects_gaps_and_duplicates() {
        let ctx = ctx();
        let id = AggregateId::new();
        let mut live = Counter::empty(id);
        live.add(&ctx, 1);
        live.add(&ctx, 1);
        live.add(&ctx, 1);
        let history = live.take_uncommitted();

        let gapped = vec![history[0].clone(), history[2].clone()];
        match Counter::empty(id).load_from_history(gapped) {
            Err(ReplayError::VersionGap { expected: 2, found: 3 }) => {}
            other => panic!("Expected VersionGap, got {other:?}"),
        }

        let duplicated = vec![history[0].clone(), history[0].clone()];
        assert!(matches!(
            Counter::empty(id).load_from_history(duplicated),
            Err(ReplayError::VersionGap { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn replay_rejects_foreign_stream() {
        let ctx = ctx();
        let mut other = Counter::empty(AggregateId::new());
        other.add(&ctx, 1);

        let result = Counter::empty(AggregateId::new()).load_from_history(other.take_uncommitted());
        assert!(matches!(result, Err(ReplayError::ForeignEvent { .. })));
    }

    #[test]
    fn replay_refuses_dirty_aggregate() {
        let ctx = ctx();
        let mut counter = Counter::empty(AggregateId::new());
        counter.add(&ctx, 1);

        assert!(matches!(
            counter.load_from_history(Vec::new()),
            Err(ReplayError::PendingChanges(1))
        ));
    }

    #[test]
    fn unknown_raw_events_advance_version_only() {
        let ctx = ctx();
        let id = AggregateId::new();
        let mut live = Counter::empty(id);
        live.add(&ctx, 5);
        live.add(&ctx, 7);
        let mut raw: Vec<DomainEvent> = live
            .take_uncommitted()
            .iter()
            .map(|e| e.to_domain_event().unwrap())
            .collect();

        let (mut header, data) = raw[1].clone().into_parts();
        header.event_type = "Multiplied".to_string();
        raw[1] = EventEnvelope::new(header, data);

        let mut replayed = Counter::empty(id);
        replayed.load_from_domain_events(&raw).unwrap();

        assert_eq!(replayed.total, 5);
        assert_eq!(replayed.version(), 2);
    }
}
