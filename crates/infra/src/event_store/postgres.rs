//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `EventStoreError` | Scenario |
//! |------------|-----------------|-------------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Another writer inserted the same stream version |
//! | Database (check violation) | `23514` | `InvalidAppend` | e.g. `aggregate_version <= 0` |
//! | Database (other) | any other | `Database` | |
//! | PoolClosed / IO / other | n/a | `Database` | Connection failures |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use clinicflow_core::{AggregateId, ClinicId, CorrelationId, TenantId, UserId};
use clinicflow_events::{DomainEvent, EventEnvelope, EventHeader};

use super::r#trait::{EventStore, EventStoreError, Pagination, StreamKey, batch_streams};

const SELECT_COLUMNS: &str = r#"
    event_id, event_type, aggregate_type, aggregate_id, aggregate_version,
    tenant_id, clinic_id, correlation_id, causation_id, user_id,
    created_at, event_data, metadata
"#;

/// Postgres-backed append-only event store (`domain_events` table).
///
/// `append_many` runs in one transaction:
/// 1. read each touched stream's current version
/// 2. reject the batch if it does not continue every stream
/// 3. insert all rows
///
/// A writer that commits between 1 and 3 trips the unique constraint on
/// `(aggregate_type, aggregate_id, aggregate_version)`, which surfaces as
/// [`EventStoreError::Concurrency`].
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn fetch(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let events = rows.iter().map(row_to_event).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn append_many(&self, events: &[DomainEvent]) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let starts = batch_streams(events)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for (key, first_version) in &starts {
            let current = check_stream_version(&mut tx, key).await?;
            if *first_version != current + 1 {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::Concurrency(format!(
                    "{}/{} is at version {current}, batch starts at {first_version}",
                    key.aggregate_type, key.aggregate_id
                )));
            }
        }

        for event in events {
            let header = event.header();
            sqlx::query(
                r#"
                INSERT INTO domain_events (
                    event_id, event_type, aggregate_type, aggregate_id, aggregate_version,
                    tenant_id, clinic_id, correlation_id, causation_id, user_id,
                    created_at, event_data, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(header.event_id)
            .bind(&header.event_type)
            .bind(&header.aggregate_type)
            .bind(header.aggregate_id.as_uuid())
            .bind(header.aggregate_version as i64)
            .bind(header.tenant_id.as_uuid())
            .bind(header.clinic_id.map(Uuid::from))
            .bind(header.correlation_id.as_uuid())
            .bind(header.causation_id)
            .bind(header.user_id.map(Uuid::from))
            .bind(header.created_at)
            .bind(event.event_data())
            .bind(header.metadata.clone().map(JsonValue::Object))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected: {}/{} version {} already exists",
                        header.aggregate_type, header.aggregate_id, header.aggregate_version
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id, event_count), err)]
    async fn get_by_aggregate_id(
        &self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events
             WHERE aggregate_type = $1 AND aggregate_id = $2
             ORDER BY aggregate_version ASC"
        );
        self.fetch(
            "get_by_aggregate_id",
            sqlx::query(&sql).bind(aggregate_type).bind(aggregate_id.as_uuid()),
        )
        .await
    }

    #[instrument(skip(self), fields(correlation_id = %correlation_id, event_count), err)]
    async fn get_by_correlation_id(&self, correlation_id: CorrelationId) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events
             WHERE correlation_id = $1
             ORDER BY global_position ASC"
        );
        self.fetch("get_by_correlation_id", sqlx::query(&sql).bind(correlation_id.as_uuid()))
            .await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, event_count), err)]
    async fn get_by_event_type(
        &self,
        tenant_id: TenantId,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events
             WHERE tenant_id = $1 AND event_type = $2
             ORDER BY global_position ASC
             LIMIT $3 OFFSET $4"
        );
        self.fetch(
            "get_by_event_type",
            sqlx::query(&sql)
                .bind(tenant_id.as_uuid())
                .bind(event_type)
                .bind(i64::from(page.limit))
                .bind(i64::from(page.offset)),
        )
        .await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, event_count), err)]
    async fn get_by_tenant(&self, tenant_id: TenantId, page: Pagination) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events
             WHERE tenant_id = $1
             ORDER BY global_position ASC
             LIMIT $2 OFFSET $3"
        );
        self.fetch(
            "get_by_tenant",
            sqlx::query(&sql)
                .bind(tenant_id.as_uuid())
                .bind(i64::from(page.limit))
                .bind(i64::from(page.offset)),
        )
        .await
    }

    #[instrument(skip(self), fields(event_count), err)]
    async fn get_unpublished(&self, limit: u32) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events
             WHERE published_at IS NULL
             ORDER BY global_position ASC
             LIMIT $1"
        );
        self.fetch("get_unpublished", sqlx::query(&sql).bind(i64::from(limit)))
            .await
    }

    #[instrument(skip(self, event_ids), fields(count = event_ids.len()), err)]
    async fn mark_published(&self, event_ids: &[Uuid]) -> Result<(), EventStoreError> {
        if event_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE domain_events SET published_at = now()
             WHERE event_id = ANY($1) AND published_at IS NULL",
        )
        .bind(event_ids)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }
}

async fn check_stream_version(tx: &mut Transaction<'_, Postgres>, key: &StreamKey) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(aggregate_version), 0) AS current_version
        FROM domain_events
        WHERE aggregate_type = $1 AND aggregate_id = $2
        "#,
    )
    .bind(&key.aggregate_type)
    .bind(key.aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    Ok(current as u64)
}

fn row_to_event(row: &PgRow) -> Result<DomainEvent, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Database(format!("failed to decode event row: {e}"));

    let aggregate_version: i64 = row.try_get("aggregate_version").map_err(decode)?;
    let clinic_id: Option<Uuid> = row.try_get("clinic_id").map_err(decode)?;
    let user_id: Option<Uuid> = row.try_get("user_id").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let metadata: Option<JsonValue> = row.try_get("metadata").map_err(decode)?;

    let header = EventHeader {
        event_id: row.try_get("event_id").map_err(decode)?,
        event_type: row.try_get("event_type").map_err(decode)?,
        aggregate_type: row.try_get("aggregate_type").map_err(decode)?,
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(decode)?),
        aggregate_version: aggregate_version as u64,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode)?),
        clinic_id: clinic_id.map(ClinicId::from_uuid),
        correlation_id: CorrelationId::from_uuid(row.try_get("correlation_id").map_err(decode)?),
        causation_id: row.try_get("causation_id").map_err(decode)?,
        user_id: user_id.map(UserId::from_uuid),
        created_at,
        metadata: match metadata {
            Some(JsonValue::Object(map)) => Some(map),
            _ => None,
        },
    };
    let event_data: JsonValue = row.try_get("event_data").map_err(decode)?;

    Ok(EventEnvelope::new(header, event_data))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Database(format!("connection pool closed in {operation}")),
        other => EventStoreError::Database(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
