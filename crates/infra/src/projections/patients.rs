//! Patient directory projection.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use clinicflow_events::{DomainEvent, Event, EventHandler};
use clinicflow_patients::PatientEvent;

use crate::read_model::{PatientReadModel, PatientView};

pub struct PatientsProjection {
    store: Arc<dyn PatientReadModel>,
}

impl PatientsProjection {
    pub const EVENT_TYPES: &'static [&'static str] = PatientEvent::EVENT_TYPES;

    pub fn new(store: Arc<dyn PatientReadModel>) -> Self {
        Self { store }
    }

    pub async fn apply_envelope(&self, envelope: &DomainEvent) -> anyhow::Result<()> {
        let Some(event) = envelope.decode::<PatientEvent>()? else {
            return Ok(());
        };
        let tenant_id = event.tenant_id();

        match event.event_data() {
            PatientEvent::PatientRegistered(e) => {
                self.store
                    .insert_patient(
                        tenant_id,
                        PatientView {
                            patient_id: e.patient_id,
                            full_name: e.full_name.clone(),
                            phone: e.phone.clone(),
                            email: e.email.clone(),
                            source: e.source,
                            registered_at: event.created_at(),
                        },
                    )
                    .await?;
            }
            PatientEvent::PatientContactUpdated(e) => {
                let found = self
                    .store
                    .update_patient_contact(tenant_id, e.patient_id, e.phone.clone(), e.email.clone())
                    .await?;
                if !found {
                    bail!("patient {} not projected yet", e.patient_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PatientsProjection {
    fn name(&self) -> &'static str {
        "patients_projection"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        self.apply_envelope(event).await
    }
}
