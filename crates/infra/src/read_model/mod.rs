//! Tenant-isolated read models fed by projection handlers.
//!
//! Read models are disposable: they can be rebuilt from the event store at
//! any time and are never the source of a domain decision. They trail the
//! store by however long the bus takes to deliver, so lookups made while
//! reacting to an event may not yet reflect that event's siblings.

pub mod in_memory;
pub mod postgres;
pub mod tenant_store;
pub mod views;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use clinicflow_core::TenantId;
use clinicflow_journey::{JourneyId, JourneyStage, Milestone, RiskLevel};
use clinicflow_messaging::{ConversationId, ConversationStatus};
use clinicflow_patients::PatientId;
use clinicflow_scheduling::{AppointmentId, AppointmentStatus};

pub use in_memory::InMemoryReadModels;
pub use postgres::PostgresReadModels;
pub use tenant_store::{InMemoryTenantStore, TenantStore};
pub use views::{AppointmentView, ConversationView, JourneyView, PatientView};

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model backend error: {0}")]
    Backend(String),

    #[error("read model row is corrupt: {0}")]
    Corrupt(String),
}

/// Appointment rows.
///
/// Mutators return `false` when the row is unknown, which callers treat as
/// "creation event not projected yet".
#[async_trait]
pub trait AppointmentReadModel: Send + Sync {
    /// Insert; no-op (returns `false`) if the appointment already exists.
    async fn insert_appointment(&self, tenant_id: TenantId, view: AppointmentView) -> Result<bool, ReadModelError>;

    async fn set_appointment_status(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
        cancellation_reason: Option<String>,
    ) -> Result<bool, ReadModelError>;

    async fn reschedule_appointment(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        starts_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Result<bool, ReadModelError>;

    async fn get_appointment(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
    ) -> Result<Option<AppointmentView>, ReadModelError>;

    /// Cancelled appointments of a patient, not counting `excluding`.
    ///
    /// Eventually consistent: cancellations still in flight are not counted.
    async fn count_cancelled_for_patient(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        excluding: AppointmentId,
    ) -> Result<u64, ReadModelError>;
}

#[async_trait]
pub trait PatientReadModel: Send + Sync {
    async fn insert_patient(&self, tenant_id: TenantId, view: PatientView) -> Result<bool, ReadModelError>;

    async fn update_patient_contact(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        phone: Option<String>,
        email: Option<String>,
    ) -> Result<bool, ReadModelError>;

    async fn get_patient(&self, tenant_id: TenantId, patient_id: PatientId) -> Result<Option<PatientView>, ReadModelError>;
}

#[async_trait]
pub trait ConversationReadModel: Send + Sync {
    async fn insert_conversation(&self, tenant_id: TenantId, view: ConversationView) -> Result<bool, ReadModelError>;

    /// Count one message, at most once per `event_id`.
    ///
    /// Returns `true` when the counter moved.
    async fn record_message(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError>;

    async fn set_conversation_status(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        status: ConversationStatus,
    ) -> Result<bool, ReadModelError>;

    async fn get_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationView>, ReadModelError>;
}

#[async_trait]
pub trait JourneyReadModel: Send + Sync {
    async fn insert_journey(&self, tenant_id: TenantId, view: JourneyView) -> Result<bool, ReadModelError>;

    async fn set_journey_stage(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        stage: JourneyStage,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError>;

    /// Add a milestone unless already present.
    async fn add_journey_milestone(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        milestone: Milestone,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError>;

    async fn set_journey_risk(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        risk_score: u8,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError>;

    async fn get_journey(&self, tenant_id: TenantId, journey_id: JourneyId) -> Result<Option<JourneyView>, ReadModelError>;

    /// Most recently started non-completed journey of a patient.
    ///
    /// Eventually consistent: a journey started moments ago may be missing,
    /// and its stage may lag the event stream. Callers replay the store
    /// before deciding anything.
    async fn find_open_by_patient(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
    ) -> Result<Option<JourneyView>, ReadModelError>;
}
