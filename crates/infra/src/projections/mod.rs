//! Projection handlers (read model builders).
//!
//! Projections consume published events and maintain query-side rows.
//! All projections are:
//! - **Rebuildable**: see [`replay::replay_tenant`]
//! - **Tenant-isolated**: every row is keyed by tenant
//! - **Idempotent**: safe for at-least-once delivery
//!
//! Projections never emit domain events. An update for a row whose creation
//! event has not been projected fails, which routes the message to the
//! dead-letter queue instead of silently dropping it.

pub mod appointments;
pub mod conversations;
pub mod journeys;
pub mod patients;
pub mod replay;

use std::sync::Arc;

use clinicflow_events::{EventHandler, RoutingTableBuilder};

use crate::read_model::{AppointmentReadModel, ConversationReadModel, JourneyReadModel, PatientReadModel};

pub use appointments::AppointmentsProjection;
pub use conversations::ConversationsProjection;
pub use journeys::JourneysProjection;
pub use patients::PatientsProjection;
pub use replay::{ReplayError, ReplayReport, replay_tenant};

/// The four standard projections over one read-model backend.
pub fn all<R>(models: Arc<R>) -> Vec<(&'static [&'static str], Arc<dyn EventHandler>)>
where
    R: AppointmentReadModel + PatientReadModel + ConversationReadModel + JourneyReadModel + 'static,
{
    let appointments: Arc<dyn EventHandler> = Arc::new(AppointmentsProjection::new(models.clone()));
    let patients: Arc<dyn EventHandler> = Arc::new(PatientsProjection::new(models.clone()));
    let conversations: Arc<dyn EventHandler> = Arc::new(ConversationsProjection::new(models.clone()));
    let journeys: Arc<dyn EventHandler> = Arc::new(JourneysProjection::new(models));

    vec![
        (AppointmentsProjection::EVENT_TYPES, appointments),
        (PatientsProjection::EVENT_TYPES, patients),
        (ConversationsProjection::EVENT_TYPES, conversations),
        (JourneysProjection::EVENT_TYPES, journeys),
    ]
}

/// Subscribe every projection to the event types it consumes.
pub fn subscribe<R>(mut builder: RoutingTableBuilder, models: Arc<R>) -> RoutingTableBuilder
where
    R: AppointmentReadModel + PatientReadModel + ConversationReadModel + JourneyReadModel + 'static,
{
    for (event_types, handler) in all(models) {
        builder = builder.subscribe_many(event_types.iter().copied(), handler);
    }
    builder
}
