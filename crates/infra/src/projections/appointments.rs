//! Appointment calendar projection.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use clinicflow_core::TenantId;
use clinicflow_events::{DomainEvent, Event, EventHandler};
use clinicflow_scheduling::{AppointmentEvent, AppointmentId, AppointmentStatus};

use crate::read_model::{AppointmentReadModel, AppointmentView};

pub struct AppointmentsProjection {
    store: Arc<dyn AppointmentReadModel>,
}

impl AppointmentsProjection {
    pub const EVENT_TYPES: &'static [&'static str] = AppointmentEvent::EVENT_TYPES;

    pub fn new(store: Arc<dyn AppointmentReadModel>) -> Self {
        Self { store }
    }

    pub async fn apply_envelope(&self, envelope: &DomainEvent) -> anyhow::Result<()> {
        let Some(event) = envelope.decode::<AppointmentEvent>()? else {
            return Ok(());
        };
        let tenant_id = event.tenant_id();

        match event.event_data() {
            AppointmentEvent::AppointmentScheduled(e) => {
                let created = self
                    .store
                    .insert_appointment(
                        tenant_id,
                        AppointmentView {
                            appointment_id: e.appointment_id,
                            patient_id: e.patient_id,
                            practitioner_id: e.practitioner_id,
                            starts_at: e.starts_at,
                            duration_minutes: e.duration_minutes,
                            status: AppointmentStatus::Scheduled,
                            cancellation_reason: None,
                        },
                    )
                    .await?;
                if !created {
                    debug!(appointment_id = %e.appointment_id, "appointment already projected");
                }
                Ok(())
            }
            AppointmentEvent::AppointmentConfirmed(e) => {
                self.set_status(tenant_id, e.appointment_id, AppointmentStatus::Confirmed, None)
                    .await
            }
            AppointmentEvent::AppointmentRescheduled(e) => {
                let found = self
                    .store
                    .reschedule_appointment(tenant_id, e.appointment_id, e.starts_at, e.duration_minutes)
                    .await?;
                if !found {
                    bail!("appointment {} not projected yet", e.appointment_id);
                }
                Ok(())
            }
            AppointmentEvent::AppointmentCancelled(e) => {
                self.set_status(tenant_id, e.appointment_id, AppointmentStatus::Cancelled, e.reason.clone())
                    .await
            }
            AppointmentEvent::AppointmentCompleted(e) => {
                self.set_status(tenant_id, e.appointment_id, AppointmentStatus::Completed, None)
                    .await
            }
            AppointmentEvent::AppointmentNoShow(e) => {
                self.set_status(tenant_id, e.appointment_id, AppointmentStatus::NoShow, None)
                    .await
            }
        }
    }

    async fn set_status(
        &self,
        tenant_id: TenantId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        let found = self
            .store
            .set_appointment_status(tenant_id, appointment_id, status, reason)
            .await?;
        if !found {
            bail!("appointment {appointment_id} not projected yet");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AppointmentsProjection {
    fn name(&self) -> &'static str {
        "appointments_projection"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        self.apply_envelope(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use clinicflow_core::AggregateId;
    use clinicflow_events::{EventContext, EventSourced};
    use clinicflow_patients::PatientId;
    use clinicflow_scheduling::{Appointment, ScheduleAppointment};

    use crate::read_model::InMemoryReadModels;

    fn scheduled(ctx: &EventContext) -> Appointment {
        Appointment::schedule(
            ctx,
            AppointmentId::new(AggregateId::new()),
            ScheduleAppointment {
                patient_id: PatientId::new(AggregateId::new()),
                practitioner_id: None,
                starts_at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
                duration_minutes: 30,
            },
        )
        .unwrap()
    }

    fn domain_events(appointment: &mut Appointment) -> Vec<DomainEvent> {
        appointment
            .take_uncommitted()
            .iter()
            .map(|e| e.to_domain_event().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn redelivered_schedule_leaves_one_row() {
        let models = Arc::new(InMemoryReadModels::new());
        let projection = AppointmentsProjection::new(models.clone());
        let ctx = EventContext::new(TenantId::new());
        let mut appointment = scheduled(&ctx);
        let events = domain_events(&mut appointment);

        projection.apply_envelope(&events[0]).await.unwrap();
        projection.apply_envelope(&events[0]).await.unwrap();

        assert_eq!(models.appointments(ctx.tenant_id()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_records_status_and_reason() {
        let models = Arc::new(InMemoryReadModels::new());
        let projection = AppointmentsProjection::new(models.clone());
        let ctx = EventContext::new(TenantId::new());
        let mut appointment = scheduled(&ctx);
        appointment.cancel(&ctx, Some("travelling".to_string())).unwrap();

        for event in domain_events(&mut appointment) {
            projection.apply_envelope(&event).await.unwrap();
        }

        let row = models
            .get_appointment(ctx.tenant_id(), appointment.id_typed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, AppointmentStatus::Cancelled);
        assert_eq!(row.cancellation_reason.as_deref(), Some("travelling"));
    }

    #[tokio::test]
    async fn update_before_creation_fails() {
        let models = Arc::new(InMemoryReadModels::new());
        let projection = AppointmentsProjection::new(models);
        let ctx = EventContext::new(TenantId::new());
        let mut appointment = scheduled(&ctx);
        appointment.confirm(&ctx).unwrap();
        let events = domain_events(&mut appointment);

        assert!(projection.apply_envelope(&events[1]).await.is_err());
    }
}
