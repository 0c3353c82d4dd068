use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use clinicflow_core::{AggregateId, CorrelationId, TenantId};
use clinicflow_events::DomainEvent;

use super::r#trait::{EventStore, EventStoreError, Pagination, StreamKey, batch_streams};

#[derive(Debug)]
struct Row {
    event: DomainEvent,
    published: bool,
}

#[derive(Debug, Default)]
struct Log {
    /// Global append order.
    rows: Vec<Row>,
    /// Row indexes per stream, ascending by version.
    streams: HashMap<StreamKey, Vec<usize>>,
    event_ids: HashMap<Uuid, usize>,
}

impl Log {
    fn current_version(&self, key: &StreamKey) -> u64 {
        self.streams
            .get(key)
            .and_then(|idx| idx.last())
            .map(|&i| self.rows[i].event.aggregate_version())
            .unwrap_or(0)
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().map(|l| l.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Log>, EventStoreError> {
        self.log
            .read()
            .map_err(|_| EventStoreError::Database("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Log>, EventStoreError> {
        self.log
            .write()
            .map_err(|_| EventStoreError::Database("lock poisoned".to_string()))
    }

    fn select<F>(&self, page: Option<Pagination>, mut keep: F) -> Result<Vec<DomainEvent>, EventStoreError>
    where
        F: FnMut(&DomainEvent) -> bool,
    {
        let log = self.read()?;
        let matching = log.rows.iter().map(|r| &r.event).filter(|e| keep(e));
        let events = match page {
            Some(p) => matching
                .skip(p.offset as usize)
                .take(p.limit as usize)
                .cloned()
                .collect(),
            None => matching.cloned().collect(),
        };
        Ok(events)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_many(&self, events: &[DomainEvent]) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let starts = batch_streams(events)?;

        let mut log = self.write()?;

        // Validate everything before touching the log so the batch is atomic.
        for (key, first_version) in &starts {
            let current = log.current_version(key);
            if *first_version != current + 1 {
                return Err(EventStoreError::Concurrency(format!(
                    "{}/{} is at version {current}, batch starts at {first_version}",
                    key.aggregate_type, key.aggregate_id
                )));
            }
        }
        let existing: HashSet<Uuid> = events
            .iter()
            .map(|e| e.event_id())
            .filter(|id| log.event_ids.contains_key(id))
            .collect();
        if let Some(id) = existing.into_iter().next() {
            return Err(EventStoreError::InvalidAppend(format!("event {id} already stored")));
        }

        for event in events {
            let idx = log.rows.len();
            log.rows.push(Row {
                event: event.clone(),
                published: false,
            });
            log.streams.entry(StreamKey::of(event)).or_default().push(idx);
            log.event_ids.insert(event.event_id(), idx);
        }

        tracing::debug!(count = events.len(), "events appended");
        Ok(())
    }

    async fn get_by_aggregate_id(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let key = StreamKey {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
        };
        let log = self.read()?;
        Ok(log
            .streams
            .get(&key)
            .map(|idx| idx.iter().map(|&i| log.rows[i].event.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_by_correlation_id(&self, correlation_id: CorrelationId) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.select(None, |e| e.correlation_id() == correlation_id)
    }

    async fn get_by_event_type(
        &self,
        tenant_id: TenantId,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.select(Some(page), |e| e.tenant_id() == tenant_id && e.event_type() == event_type)
    }

    async fn get_by_tenant(&self, tenant_id: TenantId, page: Pagination) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.select(Some(page), |e| e.tenant_id() == tenant_id)
    }

    async fn get_unpublished(&self, limit: u32) -> Result<Vec<DomainEvent>, EventStoreError> {
        let log = self.read()?;
        Ok(log
            .rows
            .iter()
            .filter(|r| !r.published)
            .take(limit as usize)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), EventStoreError> {
        let mut log = self.write()?;
        for id in event_ids {
            if let Some(&idx) = log.event_ids.get(id) {
                log.rows[idx].published = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use clinicflow_events::{EventEnvelope, EventHeader};

    fn test_event(aggregate_id: AggregateId, version: u64, tenant_id: TenantId, correlation_id: CorrelationId) -> DomainEvent {
        EventEnvelope::new(
            EventHeader {
                event_id: Uuid::now_v7(),
                event_type: "AppointmentScheduled".to_string(),
                aggregate_type: "Appointment".to_string(),
                aggregate_id,
                aggregate_version: version,
                tenant_id,
                clinic_id: None,
                correlation_id,
                causation_id: None,
                user_id: None,
                created_at: Utc::now(),
                metadata: None,
            },
            serde_json::json!({ "n": version }),
        )
    }

    fn stream(aggregate_id: AggregateId, versions: std::ops::RangeInclusive<u64>) -> Vec<DomainEvent> {
        let tenant_id = TenantId::new();
        let correlation_id = CorrelationId::new();
        versions
            .map(|v| test_event(aggregate_id, v, tenant_id, correlation_id))
            .collect()
    }

    #[tokio::test]
    async fn append_and_load_in_version_order() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let events = stream(id, 1..=3);

        store.append_many(&events).await.unwrap();
        let loaded = store.get_by_aggregate_id("Appointment", id).await.unwrap();

        let versions: Vec<u64> = loaded.iter().map(|e| e.aggregate_version()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(store.get_by_aggregate_id("Patient", id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_append_is_noop() {
        let store = InMemoryEventStore::new();
        store.append_many(&[]).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let events = stream(id, 1..=2);
        store.append_many(&events).await.unwrap();

        let again = stream(id, 2..=2);
        let err = store.append(&again[0]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn gap_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let gapped = stream(id, 2..=2);

        match store.append(&gapped[0]).await {
            Err(EventStoreError::Concurrency(_)) => {}
            other => panic!("Expected Concurrency, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_batch_stores_nothing() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store.append_many(&stream(b, 1..=1)).await.unwrap();

        // `a` is fine, `b` restarts at 1: the whole batch must be rejected.
        let mut batch = stream(a, 1..=2);
        batch.extend(stream(b, 1..=1));
        assert!(store.append_many(&batch).await.is_err());

        assert!(store.get_by_aggregate_id("Appointment", a).await.unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn non_consecutive_batch_is_invalid() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        let mut batch = stream(id, 1..=1);
        batch.extend(stream(id, 3..=3));

        assert!(matches!(
            store.append_many(&batch).await,
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_appends_of_same_version_have_one_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let event = stream(id, 1..=1).remove(0);
            tasks.push(tokio::spawn(async move { store.append(&event).await }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                Err(EventStoreError::Concurrency(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn diagnostic_queries_filter_by_tenant_type_and_correlation() {
        let store = InMemoryEventStore::new();
        let events = stream(AggregateId::new(), 1..=3);
        let other = stream(AggregateId::new(), 1..=1);
        store.append_many(&events).await.unwrap();
        store.append_many(&other).await.unwrap();

        let tenant = events[0].tenant_id();
        let by_tenant = store.get_by_tenant(tenant, Pagination::default()).await.unwrap();
        assert_eq!(by_tenant.len(), 3);

        let page = store.get_by_tenant(tenant, Pagination::new(Some(2), Some(1))).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].aggregate_version(), 2);

        let by_type = store
            .get_by_event_type(tenant, "AppointmentScheduled", Pagination::default())
            .await
            .unwrap();
        assert_eq!(by_type.len(), 3);

        let by_corr = store.get_by_correlation_id(other[0].correlation_id()).await.unwrap();
        assert_eq!(by_corr.len(), 1);
    }

    #[tokio::test]
    async fn unpublished_until_marked() {
        let store = InMemoryEventStore::new();
        let events = stream(AggregateId::new(), 1..=3);
        store.append_many(&events).await.unwrap();

        assert_eq!(store.get_unpublished(10).await.unwrap().len(), 3);
        store.mark_published(&[events[0].event_id()]).await.unwrap();

        let pending = store.get_unpublished(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event_id(), events[1].event_id());
        assert_eq!(store.get_unpublished(1).await.unwrap().len(), 1);
    }
}
