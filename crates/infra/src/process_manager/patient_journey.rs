//! Patient journey process manager.
//!
//! Listens to patient, messaging and scheduling events and drives the
//! patient's [`PatientJourney`] through the stage graph.
//!
//! | Incoming event | Reaction |
//! |----------------|----------|
//! | `PatientRegistered` | start the first journey at `lead` |
//! | `MessageReceived` | `first_message` milestone; `lead → engaged` |
//! | `AppointmentScheduled` | `first_appointment` milestone; `engaged`/`at_risk → scheduled` |
//! | `AppointmentConfirmed` | `scheduled → confirmed` |
//! | `AppointmentCancelled` | back to `engaged`, or `FREQUENT_CANCELLATIONS` risk after two earlier cancellations |
//! | `AppointmentNoShow` | `NO_SHOW` risk |
//! | `AppointmentCompleted` | `→ in_treatment`; `first_consultation_completed` milestone |
//!
//! A reaction whose source stage does not match is skipped. That covers
//! duplicate deliveries and events arriving after the journey moved on.
//!
//! Every emitted event shares the incoming event's correlation id and has
//! the incoming `event_id` as causation id.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use clinicflow_core::{AggregateId, TenantId};
use clinicflow_events::{DomainEvent, EventBus, EventContext, EventEnvelope, EventHandler, EventSourced};
use clinicflow_journey::{JourneyId, JourneyStage, Milestone, PatientJourney, RiskFactor};
use clinicflow_messaging::ConversationEvent;
use clinicflow_patients::{PatientEvent, PatientId};
use clinicflow_scheduling::{AppointmentEvent, AppointmentId};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;
use crate::read_model::{AppointmentReadModel, JourneyReadModel, ReadModelError};

/// Cancellations before the current one that flag a patient.
const FREQUENT_CANCELLATION_THRESHOLD: u64 = 2;

#[derive(Debug, Error)]
pub enum ProcessManagerError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    ReadModel(#[from] ReadModelError),

    #[error("failed to decode incoming event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// What a reaction wants to do to the loaded journey.
#[derive(Debug, Clone, Copy)]
enum Reaction {
    InboundMessage,
    Scheduled,
    Confirmed,
    Cancelled { frequent: bool },
    NoShow,
    Completed,
}

pub struct PatientJourneyProcessManager<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    journeys: Arc<dyn JourneyReadModel>,
    appointments: Arc<dyn AppointmentReadModel>,
}

impl<S, B> PatientJourneyProcessManager<S, B>
where
    S: EventStore + 'static,
    B: EventBus + 'static,
{
    pub const EVENT_TYPES: &'static [&'static str] = &[
        "PatientRegistered",
        "MessageReceived",
        "AppointmentScheduled",
        "AppointmentConfirmed",
        "AppointmentCancelled",
        "AppointmentNoShow",
        "AppointmentCompleted",
    ];

    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        journeys: Arc<dyn JourneyReadModel>,
        appointments: Arc<dyn AppointmentReadModel>,
    ) -> Self {
        Self {
            dispatcher,
            journeys,
            appointments,
        }
    }

    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), event_type = event.event_type(), correlation_id = %event.correlation_id()),
        err
    )]
    pub async fn react(&self, event: &DomainEvent) -> Result<(), ProcessManagerError> {
        if let Some(patient_event) = event.decode::<PatientEvent>()? {
            if let PatientEvent::PatientRegistered(e) = patient_event.event_data() {
                return self.start_journey(&patient_event, e.patient_id).await;
            }
            return Ok(());
        }

        if let Some(conversation_event) = event.decode::<ConversationEvent>()? {
            if let ConversationEvent::MessageReceived(e) = conversation_event.event_data() {
                return self.advance(event, e.patient_id, Reaction::InboundMessage).await;
            }
            return Ok(());
        }

        if let Some(appointment_event) = event.decode::<AppointmentEvent>()? {
            let (patient_id, reaction) = match appointment_event.event_data() {
                AppointmentEvent::AppointmentScheduled(e) => (e.patient_id, Reaction::Scheduled),
                AppointmentEvent::AppointmentConfirmed(e) => (e.patient_id, Reaction::Confirmed),
                AppointmentEvent::AppointmentCancelled(e) => {
                    let frequent = self
                        .is_frequent_canceller(event.tenant_id(), e.patient_id, e.appointment_id)
                        .await?;
                    (e.patient_id, Reaction::Cancelled { frequent })
                }
                AppointmentEvent::AppointmentNoShow(e) => (e.patient_id, Reaction::NoShow),
                AppointmentEvent::AppointmentCompleted(e) => (e.patient_id, Reaction::Completed),
                AppointmentEvent::AppointmentRescheduled(_) => return Ok(()),
            };
            return self.advance(event, patient_id, reaction).await;
        }

        Ok(())
    }

    /// Start the patient's first journey under its deterministic id. A lost
    /// version-1 race means a redelivery already started it.
    async fn start_journey<E>(&self, incoming: &EventEnvelope<E>, patient_id: PatientId) -> Result<(), ProcessManagerError> {
        let ctx = EventContext::caused_by(incoming);
        let mut journey = PatientJourney::start(&ctx, JourneyId::first_for(patient_id), patient_id);

        match self.dispatcher.create(&mut journey).await {
            Ok(_) => {
                info!(journey_id = %journey.id_typed(), patient_id = %patient_id, "journey started");
                Ok(())
            }
            Err(DispatchError::Concurrency(_)) => {
                debug!(patient_id = %patient_id, "journey already started");
                Ok(())
            }
            Err(e) => settle(e),
        }
    }

    async fn advance(&self, incoming: &DomainEvent, patient_id: PatientId, reaction: Reaction) -> Result<(), ProcessManagerError> {
        let tenant_id = incoming.tenant_id();
        let Some(journey_id) = self.open_journey_id(tenant_id, patient_id).await? else {
            debug!(patient_id = %patient_id, "no open journey, nothing to do");
            return Ok(());
        };

        let ctx = EventContext::caused_by(incoming);
        let result = self
            .dispatcher
            .execute(
                tenant_id,
                journey_id.0,
                |id| PatientJourney::empty(JourneyId::new(id)),
                |journey| apply_reaction(journey, &ctx, reaction),
            )
            .await;

        match result {
            Ok((true, events)) => {
                info!(journey_id = %journey_id, emitted = events.len(), ?reaction, "journey advanced");
                Ok(())
            }
            Ok((false, _)) => {
                debug!(journey_id = %journey_id, ?reaction, "reaction does not apply, skipped");
                Ok(())
            }
            Err(e) => settle(e),
        }
    }

    /// Find the journey to act on: the read model's open journey, or else
    /// the patient's first journey straight from the store (covers a
    /// journey whose start is not projected yet).
    async fn open_journey_id(&self, tenant_id: TenantId, patient_id: PatientId) -> Result<Option<JourneyId>, ProcessManagerError> {
        if let Some(view) = self.journeys.find_open_by_patient(tenant_id, patient_id).await? {
            return Ok(Some(view.journey_id));
        }

        let first = JourneyId::first_for(patient_id);
        let journey = self
            .dispatcher
            .load(tenant_id, first.0, |id: AggregateId| PatientJourney::empty(JourneyId::new(id)))
            .await?;
        Ok(journey.is_open().then_some(first))
    }

    async fn is_frequent_canceller(
        &self,
        tenant_id: TenantId,
        patient_id: PatientId,
        appointment_id: AppointmentId,
    ) -> Result<bool, ProcessManagerError> {
        let earlier = self
            .appointments
            .count_cancelled_for_patient(tenant_id, patient_id, appointment_id)
            .await?;
        Ok(earlier >= FREQUENT_CANCELLATION_THRESHOLD)
    }
}

/// Run one reaction against the freshly replayed journey. Returns whether
/// anything was recorded.
fn apply_reaction(journey: &mut PatientJourney, ctx: &EventContext, reaction: Reaction) -> clinicflow_core::DomainResult<bool> {
    let before = journey.uncommitted().len();
    let stage = journey.stage();

    match reaction {
        Reaction::InboundMessage => {
            journey.reach_milestone(ctx, Milestone::FirstMessage)?;
            if stage == JourneyStage::Lead {
                journey.transition_to(ctx, JourneyStage::Engaged, Some("first inbound message"))?;
            }
        }
        Reaction::Scheduled => {
            journey.reach_milestone(ctx, Milestone::FirstAppointment)?;
            if matches!(stage, JourneyStage::Engaged | JourneyStage::AtRisk) {
                journey.transition_to(ctx, JourneyStage::Scheduled, Some("appointment scheduled"))?;
            }
        }
        Reaction::Confirmed => {
            if stage == JourneyStage::Scheduled {
                journey.transition_to(ctx, JourneyStage::Confirmed, Some("appointment confirmed"))?;
            }
        }
        Reaction::Cancelled { frequent: true } => {
            raise_risk(journey, ctx, RiskFactor::frequent_cancellations())?;
        }
        Reaction::Cancelled { frequent: false } => {
            if matches!(stage, JourneyStage::Scheduled | JourneyStage::Confirmed) {
                journey.transition_to(ctx, JourneyStage::Engaged, Some("appointment cancelled"))?;
            }
        }
        Reaction::NoShow => {
            raise_risk(journey, ctx, RiskFactor::no_show())?;
        }
        Reaction::Completed => {
            if matches!(stage, JourneyStage::Scheduled | JourneyStage::Confirmed) {
                journey.transition_to(ctx, JourneyStage::InTreatment, Some("consultation completed"))?;
            }
            journey.reach_milestone(ctx, Milestone::FirstConsultationCompleted)?;
        }
    }

    Ok(journey.uncommitted().len() > before)
}

/// Raise `factor` unless a replay would change nothing: the identical
/// factor is already active and the journey will not move to `at_risk`.
fn raise_risk(journey: &mut PatientJourney, ctx: &EventContext, factor: RiskFactor) -> clinicflow_core::DomainResult<()> {
    let stage = journey.stage();
    let would_escalate = journey.risk_level().requires_intervention()
        && !matches!(stage, JourneyStage::AtRisk | JourneyStage::Completed)
        && stage.can_transition_to(JourneyStage::AtRisk);
    if journey.risk_factors().contains(&factor) && !would_escalate {
        return Ok(());
    }
    journey.detect_risk(ctx, factor)?;
    Ok(())
}

/// Stored-but-unpublished events count as done; the outbox relay publishes them.
fn settle(err: DispatchError) -> Result<(), ProcessManagerError> {
    if err.is_durable() {
        warn!(error = %err, "journey events stored, publication deferred to the outbox relay");
        return Ok(());
    }
    Err(err.into())
}

#[async_trait]
impl<S, B> EventHandler for PatientJourneyProcessManager<S, B>
where
    S: EventStore + 'static,
    B: EventBus + 'static,
{
    fn name(&self) -> &'static str {
        "patient_journey_process_manager"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        self.react(event).await?;
        Ok(())
    }
}
