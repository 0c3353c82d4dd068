//! Patient journey projection.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use clinicflow_events::{DomainEvent, Event, EventHandler};
use clinicflow_journey::{JourneyEvent, RiskLevel};

use crate::read_model::{JourneyReadModel, JourneyView};

pub struct JourneysProjection {
    store: Arc<dyn JourneyReadModel>,
}

impl JourneysProjection {
    pub const EVENT_TYPES: &'static [&'static str] = JourneyEvent::EVENT_TYPES;

    pub fn new(store: Arc<dyn JourneyReadModel>) -> Self {
        Self { store }
    }

    pub async fn apply_envelope(&self, envelope: &DomainEvent) -> anyhow::Result<()> {
        let Some(event) = envelope.decode::<JourneyEvent>()? else {
            return Ok(());
        };
        let tenant_id = event.tenant_id();
        let at = event.created_at();

        let (journey_id, found) = match event.event_data() {
            JourneyEvent::JourneyStarted(e) => {
                self.store
                    .insert_journey(
                        tenant_id,
                        JourneyView {
                            journey_id: e.journey_id,
                            patient_id: e.patient_id,
                            stage: e.stage,
                            risk_score: 0,
                            risk_level: RiskLevel::Low,
                            milestones: Vec::new(),
                            started_at: at,
                            updated_at: at,
                        },
                    )
                    .await?;
                return Ok(());
            }
            JourneyEvent::JourneyStageChanged(e) => (
                e.journey_id,
                self.store.set_journey_stage(tenant_id, e.journey_id, e.to, at).await?,
            ),
            JourneyEvent::JourneyMilestoneReached(e) => {
                // `false` also covers "already recorded", so check presence separately.
                self.store
                    .add_journey_milestone(tenant_id, e.journey_id, e.milestone, at)
                    .await?;
                let found = self.store.get_journey(tenant_id, e.journey_id).await?.is_some();
                (e.journey_id, found)
            }
            JourneyEvent::RiskDetected(e) => (
                e.journey_id,
                self.store
                    .set_journey_risk(tenant_id, e.journey_id, e.risk_score, e.risk_level, at)
                    .await?,
            ),
        };

        if !found {
            bail!("journey {journey_id} not projected yet");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for JourneysProjection {
    fn name(&self) -> &'static str {
        "journeys_projection"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        self.apply_envelope(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicflow_core::{AggregateId, TenantId};
    use clinicflow_events::{EventContext, EventSourced};
    use clinicflow_journey::{JourneyId, JourneyStage, Milestone, PatientJourney, RiskFactor};
    use clinicflow_patients::PatientId;

    use crate::read_model::InMemoryReadModels;

    #[tokio::test]
    async fn projects_stage_milestones_and_risk() {
        let models = Arc::new(InMemoryReadModels::new());
        let projection = JourneysProjection::new(models.clone());
        let ctx = EventContext::new(TenantId::new());
        let patient_id = PatientId::new(AggregateId::new());
        let mut journey = PatientJourney::start(&ctx, JourneyId::first_for(patient_id), patient_id);
        journey.reach_milestone(&ctx, Milestone::FirstMessage).unwrap();
        journey.transition_to(&ctx, JourneyStage::Engaged, None).unwrap();
        journey.detect_risk(&ctx, RiskFactor::no_show()).unwrap();

        let events: Vec<DomainEvent> = journey
            .take_uncommitted()
            .iter()
            .map(|e| e.to_domain_event().unwrap())
            .collect();
        for event in events.iter().chain(events.iter()) {
            projection.apply_envelope(event).await.unwrap();
        }

        let row = models
            .find_open_by_patient(ctx.tenant_id(), patient_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.stage, JourneyStage::AtRisk);
        assert_eq!(row.milestones, vec![Milestone::FirstMessage]);
        assert_eq!(row.risk_score, 100);
        assert_eq!(row.risk_level, RiskLevel::Critical);
    }
}
