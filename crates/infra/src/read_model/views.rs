//! Row shapes of the query-side tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clinicflow_core::UserId;
use clinicflow_journey::{JourneyId, JourneyStage, Milestone, RiskLevel};
use clinicflow_messaging::{Channel, ConversationId, ConversationStatus};
use clinicflow_patients::{AcquisitionSource, PatientId};
use clinicflow_scheduling::{AppointmentId, AppointmentStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentView {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
    pub practitioner_id: Option<UserId>,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
    pub cancellation_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientView {
    pub patient_id: PatientId,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub source: AcquisitionSource,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation_id: ConversationId,
    pub patient_id: PatientId,
    pub channel: Channel,
    pub status: ConversationStatus,
    /// Inbound plus outbound messages, each counted once per event id.
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyView {
    pub journey_id: JourneyId,
    pub patient_id: PatientId,
    pub stage: JourneyStage,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub milestones: Vec<Milestone>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JourneyView {
    /// A journey the process manager may still act on.
    pub fn is_open(&self) -> bool {
        self.stage != JourneyStage::Completed
    }
}
