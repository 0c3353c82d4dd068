//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the aggregate's stream from the store
//!   ↓
//! 2. Rehydrate (replay history into an empty aggregate)
//!   ↓
//! 3. Run the command (validates, records events on the aggregate)
//!   ↓
//! 4. Append the uncommitted events atomically (optimistic concurrency)
//!   ↓
//! 5. Publish them, then mark them published
//! ```
//!
//! Step 5 can fail after step 4 succeeded. The events are durable at that
//! point and stay unpublished in the store, where the outbox relay picks them
//! up. Callers see [`DispatchError::Publish`] and must not retry the command.

use tracing::{debug, instrument, warn};

use clinicflow_core::{AggregateId, DomainError, DomainResult, TenantId};
use clinicflow_events::{DomainEvent, EventBus, EventSourced, ReplayError};
use thiserror::Error;

use crate::event_store::{EventStore, EventStoreError};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command was rejected by the aggregate. Nothing was stored.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Lost the version race more often than the retry budget allows.
    #[error("optimistic concurrency failure: {0}")]
    Concurrency(String),

    /// The loaded stream belongs to a different tenant than the caller's.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// Stored history could not be replayed into the aggregate.
    #[error("failed to rehydrate aggregate: {0}")]
    Deserialize(#[from] ReplayError),

    #[error(transparent)]
    Store(EventStoreError),

    /// Appended but not published. The outbox relay will publish later.
    #[error("events stored but not published: {0}")]
    Publish(String),
}

impl DispatchError {
    /// The command's events are in the store despite the error.
    pub fn is_durable(&self) -> bool {
        matches!(self, DispatchError::Publish(_))
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Composes an [`EventStore`] and an [`EventBus`]; tests pass the in-memory
/// implementations, the worker passes Postgres and Redis.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    max_retries: u32,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// How many times a command is re-run after losing a version race.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus,
{
    /// Load an aggregate by replaying its stream into `make_empty(id)`.
    ///
    /// An empty stream yields the empty aggregate; commands on it return
    /// `NotFound` themselves.
    pub async fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_empty: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: EventSourced,
    {
        let history = self.store.get_by_aggregate_id(A::AGGREGATE_TYPE, aggregate_id).await?;
        if let Some(foreign) = history.iter().find(|e| e.tenant_id() != tenant_id) {
            return Err(DispatchError::TenantIsolation(format!(
                "{}/{aggregate_id} version {} belongs to another tenant",
                A::AGGREGATE_TYPE,
                foreign.aggregate_version()
            )));
        }

        let mut aggregate = make_empty(aggregate_id);
        aggregate.load_from_domain_events(&history)?;
        Ok(aggregate)
    }

    /// Store a freshly created aggregate's events.
    ///
    /// A conflict here means the id is taken; it is not retried.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %aggregate.aggregate_id()), err)]
    pub async fn create<A>(&self, aggregate: &mut A) -> Result<Vec<DomainEvent>, DispatchError>
    where
        A: EventSourced,
    {
        let events = self.append_uncommitted(aggregate).await?;
        self.publish(&events).await?;
        Ok(events)
    }

    /// Load, run `command`, append, publish.
    ///
    /// On a version conflict the aggregate is reloaded and `command` runs
    /// again, up to the retry budget. A command that records nothing stores
    /// and publishes nothing.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %aggregate_id), err)]
    pub async fn execute<A, T, F, M>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_empty: M,
        mut command: F,
    ) -> Result<(T, Vec<DomainEvent>), DispatchError>
    where
        A: EventSourced + Send,
        M: Fn(AggregateId) -> A + Send + Sync,
        F: FnMut(&mut A) -> DomainResult<T> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            let mut aggregate = self.load(tenant_id, aggregate_id, &make_empty).await?;
            let output = command(&mut aggregate)?;

            match self.append_uncommitted(&mut aggregate).await {
                Ok(events) => {
                    self.publish(&events).await?;
                    return Ok((output, events));
                }
                Err(DispatchError::Concurrency(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    debug!(attempt, %msg, "version conflict, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn append_uncommitted<A>(&self, aggregate: &mut A) -> Result<Vec<DomainEvent>, DispatchError>
    where
        A: EventSourced,
    {
        let events = aggregate
            .uncommitted()
            .iter()
            .map(|e| e.to_domain_event())
            .collect::<Result<Vec<_>, _>>()
            .map_err(EventStoreError::from)?;
        if events.is_empty() {
            return Ok(events);
        }

        self.store.append_many(&events).await?;
        aggregate.take_uncommitted();
        Ok(events)
    }

    async fn publish(&self, events: &[DomainEvent]) -> Result<(), DispatchError> {
        if events.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.bus.publish_many(events).await {
            warn!(error = %e, count = events.len(), "publish failed, leaving events to the outbox relay");
            return Err(DispatchError::Publish(e.to_string()));
        }

        let ids: Vec<_> = events.iter().map(|e| e.event_id()).collect();
        if let Err(e) = self.store.mark_published(&ids).await {
            // Only costs a duplicate delivery from the relay later.
            warn!(error = %e, "failed to mark events published");
        }
        Ok(())
    }
}
