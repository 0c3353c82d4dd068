//! Rebuilding read models from the event store.
//!
//! Read models are disposable. A rebuild clears a tenant's rows, then pages
//! through the tenant's events in store order and feeds them to the
//! projections again. Projection handlers are idempotent, so a rebuild that
//! stops halfway can simply be run again.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use clinicflow_core::TenantId;
use clinicflow_events::EventHandler;

use crate::event_store::{EventStore, EventStoreError, Pagination};

const PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("projection {projection} failed on event {event_id}: {error}")]
    Projection {
        projection: &'static str,
        event_id: uuid::Uuid,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub events_read: u64,
    pub pages: u32,
}

/// Feed every event of `tenant_id` through `projections`, oldest first.
///
/// The caller clears the tenant's read-model rows beforehand.
#[instrument(skip(store, projections), fields(tenant_id = %tenant_id), err)]
pub async fn replay_tenant<S>(
    store: &S,
    projections: &[Arc<dyn EventHandler>],
    tenant_id: TenantId,
) -> Result<ReplayReport, ReplayError>
where
    S: EventStore + ?Sized,
{
    let mut report = ReplayReport::default();
    let mut offset = 0u32;

    loop {
        let page = store
            .get_by_tenant(tenant_id, Pagination::new(Some(PAGE_SIZE), Some(offset)))
            .await?;
        report.pages += 1;

        for event in &page {
            for projection in projections {
                projection
                    .handle(event)
                    .await
                    .map_err(|e| ReplayError::Projection {
                        projection: projection.name(),
                        event_id: event.event_id(),
                        error: format!("{e:#}"),
                    })?;
            }
            report.events_read += 1;
        }

        if (page.len() as u32) < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    info!(events_read = report.events_read, pages = report.pages, "tenant replay complete");
    Ok(report)
}
