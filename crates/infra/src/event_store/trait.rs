use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use clinicflow_core::{AggregateId, CorrelationId, TenantId};
use clinicflow_events::DomainEvent;

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer got to the version first. Reload and retry.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event store backend error: {0}")]
    Database(String),
}

impl EventStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Page window for diagnostic queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Append-only event log.
///
/// ## Ordering
///
/// `(aggregate_type, aggregate_id, aggregate_version)` is unique and versions
/// are contiguous from 1 per stream. That uniqueness is the only concurrency
/// control: when two writers race for the same version exactly one wins and
/// the other gets [`EventStoreError::Concurrency`].
///
/// ## Atomicity
///
/// [`EventStore::append_many`] stores the whole batch or nothing. A batch may
/// span several streams; each stream's slice must continue that stream.
///
/// ## Outbox
///
/// Every appended event starts unpublished. The dispatcher and the outbox
/// relay call [`EventStore::mark_published`] once the bus accepted it.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &DomainEvent) -> Result<(), EventStoreError> {
        self.append_many(std::slice::from_ref(event)).await
    }

    /// Append a batch atomically. An empty batch is a no-op.
    async fn append_many(&self, events: &[DomainEvent]) -> Result<(), EventStoreError>;

    /// Full history of one aggregate, ascending by version.
    async fn get_by_aggregate_id(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Every event of one business operation, in append order.
    async fn get_by_correlation_id(&self, correlation_id: CorrelationId) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn get_by_event_type(
        &self,
        tenant_id: TenantId,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn get_by_tenant(&self, tenant_id: TenantId, page: Pagination) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Durable events the bus has not accepted yet, oldest first.
    async fn get_unpublished(&self, limit: u32) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, event: &DomainEvent) -> Result<(), EventStoreError> {
        (**self).append(event).await
    }

    async fn append_many(&self, events: &[DomainEvent]) -> Result<(), EventStoreError> {
        (**self).append_many(events).await
    }

    async fn get_by_aggregate_id(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_by_aggregate_id(aggregate_type, aggregate_id).await
    }

    async fn get_by_correlation_id(&self, correlation_id: CorrelationId) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_by_correlation_id(correlation_id).await
    }

    async fn get_by_event_type(
        &self,
        tenant_id: TenantId,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_by_event_type(tenant_id, event_type, page).await
    }

    async fn get_by_tenant(&self, tenant_id: TenantId, page: Pagination) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_by_tenant(tenant_id, page).await
    }

    async fn get_unpublished(&self, limit: u32) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_unpublished(limit).await
    }

    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), EventStoreError> {
        (**self).mark_published(event_ids).await
    }
}

/// Stream identity: `(aggregate_type, aggregate_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
}

impl StreamKey {
    pub fn of(event: &DomainEvent) -> Self {
        Self {
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id(),
        }
    }
}

/// First version each stream in the batch starts at, after checking that the
/// batch itself is well formed (versions ≥ 1, consecutive per stream, no
/// repeated event ids).
pub(crate) fn batch_streams(events: &[DomainEvent]) -> Result<Vec<(StreamKey, u64)>, EventStoreError> {
    let mut last_seen: HashMap<StreamKey, u64> = HashMap::new();
    let mut order: Vec<(StreamKey, u64)> = Vec::new();
    let mut ids = std::collections::HashSet::with_capacity(events.len());

    for (idx, event) in events.iter().enumerate() {
        if !ids.insert(event.event_id()) {
            return Err(EventStoreError::InvalidAppend(format!(
                "duplicate event_id {} in batch (index {idx})",
                event.event_id()
            )));
        }

        let version = event.aggregate_version();
        if version == 0 {
            return Err(EventStoreError::InvalidAppend(format!(
                "aggregate_version must start at 1 (index {idx})"
            )));
        }

        let key = StreamKey::of(event);
        match last_seen.get_mut(&key) {
            Some(last) => {
                if version != *last + 1 {
                    return Err(EventStoreError::InvalidAppend(format!(
                        "batch versions for {}/{} are not consecutive at index {idx}",
                        key.aggregate_type, key.aggregate_id
                    )));
                }
                *last = version;
            }
            None => {
                last_seen.insert(key.clone(), version);
                order.push((key, version));
            }
        }
    }

    Ok(order)
}
