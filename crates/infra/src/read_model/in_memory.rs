use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use clinicflow_core::TenantId;
use clinicflow_journey::{JourneyId, JourneyStage, Milestone, RiskLevel};
use clinicflow_messaging::{ConversationId, ConversationStatus};
use clinicflow_patients::PatientId;
use clinicflow_scheduling::{AppointmentId, AppointmentStatus};

use super::tenant_store::{InMemoryTenantStore, TenantStore};
use super::views::{AppointmentView, ConversationView, JourneyView, PatientView};
use super::{AppointmentReadModel, ConversationReadModel, JourneyReadModel, PatientReadModel, ReadModelError};

/// All read models in process memory, for tests and the dev worker.
#[derive(Debug, Default)]
pub struct InMemoryReadModels {
    appointments: InMemoryTenantStore<AppointmentId, AppointmentView>,
    patients: InMemoryTenantStore<PatientId, PatientView>,
    conversations: InMemoryTenantStore<ConversationId, ConversationView>,
    counted_messages: Mutex<HashSet<(TenantId, Uuid)>>,
    journeys: InMemoryTenantStore<JourneyId, JourneyView>,
}

impl InMemoryReadModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn appointments(&self, tenant_id: TenantId) -> Result<Vec<AppointmentView>, ReadModelError> {
        self.appointments.list(tenant_id)
    }

    pub fn journeys(&self, tenant_id: TenantId) -> Result<Vec<JourneyView>, ReadModelError> {
        self.journeys.list(tenant_id)
    }

    /// Drop every row of a tenant before a rebuild.
    pub fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), ReadModelError> {
        self.appointments.clear_tenant(tenant_id)?;
        self.patients.clear_tenant(tenant_id)?;
        self.conversations.clear_tenant(tenant_id)?;
        self.journeys.clear_tenant(tenant_id)?;
        self.counted_messages
            .lock()
            .map_err(|_| ReadModelError::Backend("counted message set poisoned".to_string()))?
            .retain(|(t, _)| *t != tenant_id);
        Ok(())
    }
}

#[async_trait]
impl AppointmentReadModel for InMemoryReadModels {
    async fn insert_appointment(&self, tenant_id: TenantId, view: AppointmentView) -> Result<bool, ReadModelError> {
        self.appointments.insert_if_absent(tenant_id, view.appointment_id, view)
    }

    async fn set_appointment_status(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
        cancellation_reason: Option<String>,
    ) -> Result<bool, ReadModelError> {
        self.appointments.update(tenant_id, &appointment_id, &mut |row| {
            row.status = status;
            if status == AppointmentStatus::Cancelled {
                row.cancellation_reason = cancellation_reason.clone();
            }
        })
    }

    async fn reschedule_appointment(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        starts_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Result<bool, ReadModelError> {
        self.appointments.update(tenant_id, &appointment_id, &mut |row| {
            row.starts_at = starts_at;
            row.duration_minutes = duration_minutes;
            row.status = AppointmentStatus::Scheduled;
        })
    }

    async fn get_appointment(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
    ) -> Result<Option<AppointmentView>, ReadModelError> {
        self.appointments.get(tenant_id, &appointment_id)
    }

    async fn count_cancelled_for_patient(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        excluding: AppointmentId,
    ) -> Result<u64, ReadModelError> {
        let count = self
            .appointments
            .list(tenant_id)?
            .into_iter()
            .filter(|row| {
                row.patient_id == patient_id
                    && row.appointment_id != excluding
                    && row.status == AppointmentStatus::Cancelled
            })
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl PatientReadModel for InMemoryReadModels {
    async fn insert_patient(&self, tenant_id: TenantId, view: PatientView) -> Result<bool, ReadModelError> {
        self.patients.insert_if_absent(tenant_id, view.patient_id, view)
    }

    async fn update_patient_contact(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        phone: Option<String>,
        email: Option<String>,
    ) -> Result<bool, ReadModelError> {
        self.patients.update(tenant_id, &patient_id, &mut |row| {
            row.phone = phone.clone();
            row.email = email.clone();
        })
    }

    async fn get_patient(&self, tenant_id: TenantId, patient_id: PatientId) -> Result<Option<PatientView>, ReadModelError> {
        self.patients.get(tenant_id, &patient_id)
    }
}

#[async_trait]
impl ConversationReadModel for InMemoryReadModels {
    async fn insert_conversation(&self, tenant_id: TenantId, view: ConversationView) -> Result<bool, ReadModelError> {
        self.conversations.insert_if_absent(tenant_id, view.conversation_id, view)
    }

    async fn record_message(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        if self.conversations.get(tenant_id, &conversation_id)?.is_none() {
            return Ok(false);
        }

        let mut counted = self
            .counted_messages
            .lock()
            .map_err(|_| ReadModelError::Backend("counted message set poisoned".to_string()))?;
        if !counted.insert((tenant_id, event_id)) {
            return Ok(false);
        }

        self.conversations.update(tenant_id, &conversation_id, &mut |row| {
            row.message_count += 1;
            row.last_message_at = Some(row.last_message_at.map_or(at, |prev| prev.max(at)));
        })
    }

    async fn set_conversation_status(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        status: ConversationStatus,
    ) -> Result<bool, ReadModelError> {
        self.conversations
            .update(tenant_id, &conversation_id, &mut |row| row.status = status)
    }

    async fn get_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationView>, ReadModelError> {
        self.conversations.get(tenant_id, &conversation_id)
    }
}

#[async_trait]
impl JourneyReadModel for InMemoryReadModels {
    async fn insert_journey(&self, tenant_id: TenantId, view: JourneyView) -> Result<bool, ReadModelError> {
        self.journeys.insert_if_absent(tenant_id, view.journey_id, view)
    }

    async fn set_journey_stage(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        stage: JourneyStage,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        self.journeys.update(tenant_id, &journey_id, &mut |row| {
            row.stage = stage;
            row.updated_at = at;
        })
    }

    async fn add_journey_milestone(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        milestone: Milestone,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        let mut added = false;
        self.journeys.update(tenant_id, &journey_id, &mut |row| {
            if !row.milestones.contains(&milestone) {
                row.milestones.push(milestone);
                row.updated_at = at;
                added = true;
            }
        })?;
        Ok(added)
    }

    async fn set_journey_risk(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        risk_score: u8,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        self.journeys.update(tenant_id, &journey_id, &mut |row| {
            row.risk_score = risk_score;
            row.risk_level = risk_level;
            row.updated_at = at;
        })
    }

    async fn get_journey(&self, tenant_id: TenantId, journey_id: JourneyId) -> Result<Option<JourneyView>, ReadModelError> {
        self.journeys.get(tenant_id, &journey_id)
    }

    async fn find_open_by_patient(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
    ) -> Result<Option<JourneyView>, ReadModelError> {
        Ok(self
            .journeys
            .list(tenant_id)?
            .into_iter()
            .filter(|row| row.patient_id == patient_id && row.is_open())
            .max_by_key(|row| row.started_at))
    }
}
