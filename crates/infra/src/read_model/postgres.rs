//! Postgres-backed read models.
//!
//! Every table carries `tenant_id` in its primary key and every query filters
//! on it, so cross-tenant reads are impossible by construction. Enum columns
//! hold the same snake_case strings the event payloads use.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use clinicflow_core::{AggregateId, TenantId, UserId};
use clinicflow_journey::{JourneyId, JourneyStage, Milestone, RiskLevel};
use clinicflow_messaging::{ConversationId, ConversationStatus};
use clinicflow_patients::PatientId;
use clinicflow_scheduling::{AppointmentId, AppointmentStatus};

use super::views::{AppointmentView, ConversationView, JourneyView, PatientView};
use super::{AppointmentReadModel, ConversationReadModel, JourneyReadModel, PatientReadModel, ReadModelError};

#[derive(Debug, Clone)]
pub struct PostgresReadModels {
    pool: Arc<PgPool>,
}

impl PostgresReadModels {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Drop every row of a tenant before a rebuild.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(backend("begin_transaction"))?;
        for table in [
            "appointments",
            "patients",
            "conversations",
            "conversation_counted_messages",
            "patient_journeys",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE tenant_id = $1"))
                .bind(tenant_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(backend("clear_tenant"))?;
        }
        tx.commit().await.map_err(backend("commit_transaction"))?;
        Ok(())
    }
}

#[async_trait]
impl AppointmentReadModel for PostgresReadModels {
    #[instrument(skip(self, view), fields(appointment_id = %view.appointment_id), err)]
    async fn insert_appointment(&self, tenant_id: TenantId, view: AppointmentView) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            INSERT INTO appointments (
                tenant_id, appointment_id, patient_id, practitioner_id,
                starts_at, duration_minutes, status, cancellation_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, appointment_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(view.appointment_id.0.as_uuid())
        .bind(view.patient_id.0.as_uuid())
        .bind(view.practitioner_id.map(Uuid::from))
        .bind(view.starts_at)
        .bind(view.duration_minutes as i32)
        .bind(view.status.as_str())
        .bind(&view.cancellation_reason)
        .execute(&*self.pool)
        .await
        .map_err(backend("insert_appointment"))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, cancellation_reason), fields(appointment_id = %appointment_id), err)]
    async fn set_appointment_status(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
        cancellation_reason: Option<String>,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            UPDATE appointments
            SET status = $3,
                cancellation_reason = CASE WHEN $3 = 'cancelled' THEN $4 ELSE cancellation_reason END,
                updated_at = now()
            WHERE tenant_id = $1 AND appointment_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(appointment_id.0.as_uuid())
        .bind(status.as_str())
        .bind(cancellation_reason)
        .execute(&*self.pool)
        .await
        .map_err(backend("set_appointment_status"))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(appointment_id = %appointment_id), err)]
    async fn reschedule_appointment(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        starts_at: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            UPDATE appointments
            SET starts_at = $3, duration_minutes = $4, status = 'scheduled', updated_at = now()
            WHERE tenant_id = $1 AND appointment_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(appointment_id.0.as_uuid())
        .bind(starts_at)
        .bind(duration_minutes as i32)
        .execute(&*self.pool)
        .await
        .map_err(backend("reschedule_appointment"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_appointment(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
    ) -> Result<Option<AppointmentView>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT appointment_id, patient_id, practitioner_id, starts_at,
                   duration_minutes, status, cancellation_reason
            FROM appointments
            WHERE tenant_id = $1 AND appointment_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(appointment_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("get_appointment"))?;

        row.as_ref().map(appointment_from_row).transpose()
    }

    #[instrument(skip(self), fields(patient_id = %patient_id), err)]
    async fn count_cancelled_for_patient(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        excluding: AppointmentId,
    ) -> Result<u64, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS cancelled
            FROM appointments
            WHERE tenant_id = $1 AND patient_id = $2
              AND appointment_id <> $3 AND status = 'cancelled'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(patient_id.0.as_uuid())
        .bind(excluding.0.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(backend("count_cancelled_for_patient"))?;

        let cancelled: i64 = row.try_get("cancelled").map_err(corrupt)?;
        Ok(cancelled.max(0) as u64)
    }
}

#[async_trait]
impl PatientReadModel for PostgresReadModels {
    #[instrument(skip(self, view), fields(patient_id = %view.patient_id), err)]
    async fn insert_patient(&self, tenant_id: TenantId, view: PatientView) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            INSERT INTO patients (tenant_id, patient_id, full_name, phone, email, source, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, patient_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(view.patient_id.0.as_uuid())
        .bind(&view.full_name)
        .bind(&view.phone)
        .bind(&view.email)
        .bind(to_text(&view.source)?)
        .bind(view.registered_at)
        .execute(&*self.pool)
        .await
        .map_err(backend("insert_patient"))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, phone, email), fields(patient_id = %patient_id), err)]
    async fn update_patient_contact(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        phone: Option<String>,
        email: Option<String>,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            "UPDATE patients SET phone = $3, email = $4 WHERE tenant_id = $1 AND patient_id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(patient_id.0.as_uuid())
        .bind(phone)
        .bind(email)
        .execute(&*self.pool)
        .await
        .map_err(backend("update_patient_contact"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_patient(&self, tenant_id: TenantId, patient_id: PatientId) -> Result<Option<PatientView>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT patient_id, full_name, phone, email, source, registered_at
            FROM patients
            WHERE tenant_id = $1 AND patient_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(patient_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("get_patient"))?;

        row.as_ref()
            .map(|r| {
                Ok(PatientView {
                    patient_id: PatientId::new(aggregate_id(r, "patient_id")?),
                    full_name: r.try_get("full_name").map_err(corrupt)?,
                    phone: r.try_get("phone").map_err(corrupt)?,
                    email: r.try_get("email").map_err(corrupt)?,
                    source: from_text(r, "source")?,
                    registered_at: r.try_get("registered_at").map_err(corrupt)?,
                })
            })
            .transpose()
    }
}

#[async_trait]
impl ConversationReadModel for PostgresReadModels {
    #[instrument(skip(self, view), fields(conversation_id = %view.conversation_id), err)]
    async fn insert_conversation(&self, tenant_id: TenantId, view: ConversationView) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            INSERT INTO conversations (
                tenant_id, conversation_id, patient_id, channel, status, message_count, last_message_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, conversation_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(view.conversation_id.0.as_uuid())
        .bind(view.patient_id.0.as_uuid())
        .bind(to_text(&view.channel)?)
        .bind(view.status.as_str())
        .bind(view.message_count as i64)
        .bind(view.last_message_at)
        .execute(&*self.pool)
        .await
        .map_err(backend("insert_conversation"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Dedup and increment share one transaction: the counted-message row
    /// only survives when the counter moved.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, event_id = %event_id), err)]
    async fn record_message(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        let mut tx = self.pool.begin().await.map_err(backend("begin_transaction"))?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO conversation_counted_messages (tenant_id, event_id, conversation_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, event_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(event_id)
        .bind(conversation_id.0.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(backend("claim_message"))?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await.map_err(backend("rollback"))?;
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"
            UPDATE conversations
            SET message_count = message_count + 1,
                last_message_at = GREATEST(COALESCE(last_message_at, $3), $3)
            WHERE tenant_id = $1 AND conversation_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(conversation_id.0.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(backend("increment_message_count"))?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(backend("rollback"))?;
            return Ok(false);
        }

        tx.commit().await.map_err(backend("commit_transaction"))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id), err)]
    async fn set_conversation_status(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
        status: ConversationStatus,
    ) -> Result<bool, ReadModelError> {
        let result =
            sqlx::query("UPDATE conversations SET status = $3 WHERE tenant_id = $1 AND conversation_id = $2")
                .bind(tenant_id.as_uuid())
                .bind(conversation_id.0.as_uuid())
                .bind(status.as_str())
                .execute(&*self.pool)
                .await
                .map_err(backend("set_conversation_status"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_conversation(
        &self,
        tenant_id: TenantId,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationView>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, patient_id, channel, status, message_count, last_message_at
            FROM conversations
            WHERE tenant_id = $1 AND conversation_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(conversation_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("get_conversation"))?;

        row.as_ref()
            .map(|r| {
                let message_count: i64 = r.try_get("message_count").map_err(corrupt)?;
                Ok(ConversationView {
                    conversation_id: ConversationId::new(aggregate_id(r, "conversation_id")?),
                    patient_id: PatientId::new(aggregate_id(r, "patient_id")?),
                    channel: from_text(r, "channel")?,
                    status: from_text(r, "status")?,
                    message_count: message_count.max(0) as u64,
                    last_message_at: r.try_get("last_message_at").map_err(corrupt)?,
                })
            })
            .transpose()
    }
}

#[async_trait]
impl JourneyReadModel for PostgresReadModels {
    #[instrument(skip(self, view), fields(journey_id = %view.journey_id), err)]
    async fn insert_journey(&self, tenant_id: TenantId, view: JourneyView) -> Result<bool, ReadModelError> {
        let milestones: Vec<String> = view.milestones.iter().map(|m| m.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO patient_journeys (
                tenant_id, journey_id, patient_id, stage, risk_score, risk_level,
                milestones, started_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, journey_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(view.journey_id.0.as_uuid())
        .bind(view.patient_id.0.as_uuid())
        .bind(view.stage.as_str())
        .bind(i16::from(view.risk_score))
        .bind(view.risk_level.as_str())
        .bind(&milestones)
        .bind(view.started_at)
        .bind(view.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(backend("insert_journey"))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(journey_id = %journey_id, stage = stage.as_str()), err)]
    async fn set_journey_stage(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        stage: JourneyStage,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            "UPDATE patient_journeys SET stage = $3, updated_at = $4 WHERE tenant_id = $1 AND journey_id = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(journey_id.0.as_uuid())
        .bind(stage.as_str())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(backend("set_journey_stage"))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(journey_id = %journey_id, milestone = milestone.as_str()), err)]
    async fn add_journey_milestone(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        milestone: Milestone,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            UPDATE patient_journeys
            SET milestones = array_append(milestones, $3), updated_at = $4
            WHERE tenant_id = $1 AND journey_id = $2 AND NOT ($3 = ANY(milestones))
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(journey_id.0.as_uuid())
        .bind(milestone.as_str())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(backend("add_journey_milestone"))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(journey_id = %journey_id), err)]
    async fn set_journey_risk(
        &self,
        tenant_id: TenantId,
        journey_id: JourneyId,
        risk_score: u8,
        risk_level: RiskLevel,
        at: DateTime<Utc>,
    ) -> Result<bool, ReadModelError> {
        let result = sqlx::query(
            r#"
            UPDATE patient_journeys
            SET risk_score = $3, risk_level = $4, updated_at = $5
            WHERE tenant_id = $1 AND journey_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(journey_id.0.as_uuid())
        .bind(i16::from(risk_score))
        .bind(risk_level.as_str())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(backend("set_journey_risk"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_journey(&self, tenant_id: TenantId, journey_id: JourneyId) -> Result<Option<JourneyView>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT journey_id, patient_id, stage, risk_score, risk_level, milestones, started_at, updated_at
            FROM patient_journeys
            WHERE tenant_id = $1 AND journey_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(journey_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("get_journey"))?;

        row.as_ref().map(journey_from_row).transpose()
    }

    #[instrument(skip(self), fields(patient_id = %patient_id), err)]
    async fn find_open_by_patient(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
    ) -> Result<Option<JourneyView>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT journey_id, patient_id, stage, risk_score, risk_level, milestones, started_at, updated_at
            FROM patient_journeys
            WHERE tenant_id = $1 AND patient_id = $2 AND stage <> 'completed'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(patient_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("find_open_by_patient"))?;

        row.as_ref().map(journey_from_row).transpose()
    }
}

fn appointment_from_row(row: &PgRow) -> Result<AppointmentView, ReadModelError> {
    let practitioner_id: Option<Uuid> = row.try_get("practitioner_id").map_err(corrupt)?;
    let duration_minutes: i32 = row.try_get("duration_minutes").map_err(corrupt)?;
    Ok(AppointmentView {
        appointment_id: AppointmentId::new(aggregate_id(row, "appointment_id")?),
        patient_id: PatientId::new(aggregate_id(row, "patient_id")?),
        practitioner_id: practitioner_id.map(UserId::from_uuid),
        starts_at: row.try_get("starts_at").map_err(corrupt)?,
        duration_minutes: u32::try_from(duration_minutes)
            .map_err(|_| ReadModelError::Corrupt(format!("negative duration_minutes {duration_minutes}")))?,
        status: from_text(row, "status")?,
        cancellation_reason: row.try_get("cancellation_reason").map_err(corrupt)?,
    })
}

fn journey_from_row(row: &PgRow) -> Result<JourneyView, ReadModelError> {
    let risk_score: i16 = row.try_get("risk_score").map_err(corrupt)?;
    let milestones: Vec<String> = row.try_get("milestones").map_err(corrupt)?;
    Ok(JourneyView {
        journey_id: JourneyId::new(aggregate_id(row, "journey_id")?),
        patient_id: PatientId::new(aggregate_id(row, "patient_id")?),
        stage: from_text(row, "stage")?,
        risk_score: u8::try_from(risk_score)
            .map_err(|_| ReadModelError::Corrupt(format!("risk_score {risk_score} out of range")))?,
        risk_level: from_text(row, "risk_level")?,
        milestones: milestones
            .into_iter()
            .map(|m| decode_text(&m))
            .collect::<Result<Vec<Milestone>, _>>()?,
        started_at: row.try_get("started_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn aggregate_id(row: &PgRow, column: &str) -> Result<AggregateId, ReadModelError> {
    let uuid: Uuid = row.try_get(column).map_err(corrupt)?;
    Ok(AggregateId::from_uuid(uuid))
}

fn to_text<T: Serialize>(value: &T) -> Result<String, ReadModelError> {
    match serde_json::to_value(value) {
        Ok(JsonValue::String(s)) => Ok(s),
        Ok(other) => Err(ReadModelError::Corrupt(format!("expected a string enum, got {other}"))),
        Err(e) => Err(ReadModelError::Corrupt(e.to_string())),
    }
}

fn from_text<T: DeserializeOwned>(row: &PgRow, column: &str) -> Result<T, ReadModelError> {
    let raw: String = row.try_get(column).map_err(corrupt)?;
    decode_text(&raw)
}

fn decode_text<T: DeserializeOwned>(raw: &str) -> Result<T, ReadModelError> {
    serde_json::from_value(JsonValue::String(raw.to_string()))
        .map_err(|e| ReadModelError::Corrupt(format!("unexpected value {raw:?}: {e}")))
}

fn backend(operation: &'static str) -> impl Fn(sqlx::Error) -> ReadModelError {
    move |e| ReadModelError::Backend(format!("sqlx error in {operation}: {e}"))
}

fn corrupt(e: sqlx::Error) -> ReadModelError {
    ReadModelError::Corrupt(e.to_string())
}
