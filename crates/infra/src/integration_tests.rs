//! Integration tests for the full event-sourced pipeline.
//!
//! Command → EventStore → EventBus → consumer → projections and the patient
//! journey process manager → read models, all on the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use clinicflow_core::{AggregateId, TenantId};
use clinicflow_events::{DomainEvent, EventBus, EventContext, EventHandler, InMemoryEventBus, RoutingTable};
use clinicflow_journey::{JourneyId, JourneyStage, Milestone, RiskLevel};
use clinicflow_messaging::{Channel, Conversation, ConversationId};
use clinicflow_patients::{AcquisitionSource, Patient, PatientId, RegisterPatient};
use clinicflow_scheduling::{Appointment, AppointmentId, AppointmentStatus, ScheduleAppointment};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::outbox::{OutboxConfig, OutboxRelay};
use crate::process_manager::PatientJourneyProcessManager;
use crate::projections;
use crate::read_model::{ConversationReadModel, InMemoryReadModels, JourneyReadModel, PatientReadModel};
use crate::workers::event_consumer::{ConsumerConfig, EventConsumer, Outcome};

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus>;
type Dispatcher = CommandDispatcher<Store, Bus>;

struct Engine {
    store: Store,
    bus: Bus,
    dispatcher: Arc<Dispatcher>,
    models: Arc<InMemoryReadModels>,
    consumer: EventConsumer<Bus>,
}

fn engine_with(extra: Option<(&'static str, Arc<dyn EventHandler>)>) -> Engine {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let dispatcher = Arc::new(CommandDispatcher::new(store.clone(), bus.clone()));
    let models = Arc::new(InMemoryReadModels::new());

    let journey_pm: Arc<dyn EventHandler> =
        Arc::new(PatientJourneyProcessManager::new(dispatcher.clone(), models.clone(), models.clone()));
    let mut builder = projections::subscribe(RoutingTable::builder(), models.clone())
        .subscribe_many(PatientJourneyProcessManager::<Store, Bus>::EVENT_TYPES.iter().copied(), journey_pm);
    if let Some((event_type, handler)) = extra {
        builder = builder.subscribe(event_type, handler);
    }

    let consumer = EventConsumer::new(
        bus.clone(),
        builder.build(),
        ConsumerConfig::default()
            .with_name("integration")
            .with_poll_wait(Duration::from_millis(10)),
    );

    Engine {
        store,
        bus,
        dispatcher,
        models,
        consumer,
    }
}

fn engine() -> Engine {
    engine_with(None)
}

impl Engine {
    /// Consume until the queue stays empty, including everything handlers publish.
    async fn drain(&self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.consumer.process_one().await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn register_patient(&self, ctx: &EventContext) -> (PatientId, Vec<DomainEvent>) {
        let mut patient = Patient::register(
            ctx,
            PatientId::new(AggregateId::new()),
            RegisterPatient {
                full_name: "Omar Haddad".to_string(),
                phone: Some("+96170000000".to_string()),
                email: Some("omar@example.com".to_string()),
                source: AcquisitionSource::Whatsapp,
            },
        )
        .unwrap();
        let events = self.dispatcher.create(&mut patient).await.unwrap();
        (patient.id_typed(), events)
    }

    async fn inbound_message(&self, ctx: &EventContext, patient_id: PatientId) -> (ConversationId, Vec<DomainEvent>) {
        let mut conversation = Conversation::start(ctx, ConversationId::new(AggregateId::new()), patient_id, Channel::Whatsapp);
        conversation.receive_message(ctx, "Hi, do you have a slot next week?").unwrap();
        let events = self.dispatcher.create(&mut conversation).await.unwrap();
        (conversation.id_typed(), events)
    }

    async fn schedule(&self, ctx: &EventContext, patient_id: PatientId) -> AppointmentId {
        let mut appointment = Appointment::schedule(
            ctx,
            AppointmentId::new(AggregateId::new()),
            ScheduleAppointment {
                patient_id,
                practitioner_id: None,
                starts_at: Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap(),
                duration_minutes: 30,
            },
        )
        .unwrap();
        self.dispatcher.create(&mut appointment).await.unwrap();
        appointment.id_typed()
    }
}

fn empty_appointment(id: AggregateId) -> Appointment {
    Appointment::empty(AppointmentId::new(id))
}

#[tokio::test]
async fn no_show_drives_the_journey_at_risk_end_to_end() {
    let engine = engine();
    let tenant_id = TenantId::new();

    let (patient_id, _) = engine.register_patient(&EventContext::new(tenant_id)).await;
    engine.drain().await;
    let (conversation_id, _) = engine.inbound_message(&EventContext::new(tenant_id), patient_id).await;
    engine.drain().await;
    let appointment_id = engine.schedule(&EventContext::new(tenant_id), patient_id).await;
    engine.drain().await;

    let ctx = EventContext::new(tenant_id);
    let (_, no_show_events) = engine
        .dispatcher
        .execute(tenant_id, appointment_id.0, empty_appointment, |a| a.mark_no_show(&ctx))
        .await
        .unwrap();
    let outcomes = engine.drain().await;
    assert!(outcomes.iter().all(|o| *o == Outcome::Acked));
    assert!(engine.bus.dead_letters().is_empty());

    let no_show = &no_show_events[0];
    let chain = engine.store.get_by_correlation_id(no_show.correlation_id()).await.unwrap();
    let risk = chain.iter().find(|e| e.event_type() == "RiskDetected").unwrap();
    let stage_change = chain.iter().find(|e| e.event_type() == "JourneyStageChanged").unwrap();
    for reaction in [risk, stage_change] {
        assert_eq!(reaction.correlation_id(), no_show.correlation_id());
        assert_eq!(reaction.causation_id(), Some(no_show.event_id()));
        assert_eq!(reaction.tenant_id(), tenant_id);
    }
    assert!(risk.aggregate_version() < stage_change.aggregate_version());
    assert_eq!(stage_change.data_str("to"), Some("at_risk"));

    let journey = engine
        .models
        .get_journey(tenant_id, JourneyId::first_for(patient_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(journey.stage, JourneyStage::AtRisk);
    assert_eq!(journey.risk_score, 100);
    assert_eq!(journey.risk_level, RiskLevel::Critical);
    assert_eq!(journey.milestones, vec![Milestone::FirstMessage, Milestone::FirstAppointment]);

    let appointment = engine.models.appointments(tenant_id).unwrap();
    assert_eq!(appointment.len(), 1);
    assert_eq!(appointment[0].status, AppointmentStatus::NoShow);

    let conversation = engine
        .models
        .get_conversation(tenant_id, conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.message_count, 1);
}

#[tokio::test]
async fn redelivered_events_do_not_duplicate_effects() {
    let engine = engine();
    let tenant_id = TenantId::new();

    let (patient_id, registered) = engine.register_patient(&EventContext::new(tenant_id)).await;
    let (conversation_id, conversation_events) = engine.inbound_message(&EventContext::new(tenant_id), patient_id).await;
    for event in registered.iter().chain(conversation_events.iter()) {
        engine.bus.publish(event).await.unwrap();
    }
    engine.drain().await;

    assert!(engine.models.get_patient(tenant_id, patient_id).await.unwrap().is_some());
    let conversation = engine
        .models
        .get_conversation(tenant_id, conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.message_count, 1);

    let journey_stream = engine
        .store
        .get_by_aggregate_id("PatientJourney", JourneyId::first_for(patient_id).0)
        .await
        .unwrap();
    let types: Vec<&str> = journey_stream.iter().map(|e| e.event_type()).collect();
    assert_eq!(types, vec!["JourneyStarted", "JourneyMilestoneReached", "JourneyStageChanged"]);
    assert!(engine.bus.dead_letters().is_empty());
}

struct AlwaysFails;

#[async_trait]
impl EventHandler for AlwaysFails {
    fn name(&self) -> &'static str {
        "crm_sync"
    }

    async fn handle(&self, _event: &DomainEvent) -> anyhow::Result<()> {
        anyhow::bail!("crm unreachable")
    }
}

#[tokio::test]
async fn failing_handler_sends_the_message_to_the_dead_letter_queue() {
    let engine = engine_with(Some(("PatientRegistered", Arc::new(AlwaysFails))));
    let tenant_id = TenantId::new();

    let (patient_id, registered) = engine.register_patient(&EventContext::new(tenant_id)).await;
    engine.drain().await;

    let dead = engine.bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.event_id(), registered[0].event_id());
    assert!(dead[0].reason.contains("crm_sync"));
    assert!(dead[0].reason.contains("crm unreachable"));
    assert_eq!(engine.bus.pending(), 0);
    assert_eq!(engine.bus.in_flight(), 0);
    assert_eq!(engine.consumer.stats().dead_lettered, 1);

    // The other handlers still ran.
    assert!(engine.models.get_patient(tenant_id, patient_id).await.unwrap().is_some());
}

#[tokio::test]
async fn events_stored_during_a_bus_outage_are_relayed() {
    let engine = engine();
    let tenant_id = TenantId::new();
    let ctx = EventContext::new(tenant_id);

    engine.bus.set_available(false);
    let mut patient = Patient::register(
        &ctx,
        PatientId::new(AggregateId::new()),
        RegisterPatient {
            full_name: "Maya Khoury".to_string(),
            phone: None,
            email: Some("maya@example.com".to_string()),
            source: AcquisitionSource::Website,
        },
    )
    .unwrap();
    let err = engine.dispatcher.create(&mut patient).await.unwrap_err();
    assert!(matches!(err, DispatchError::Publish(_)));
    assert!(err.is_durable());
    assert_eq!(engine.store.get_unpublished(10).await.unwrap().len(), 1);

    engine.bus.set_available(true);
    let relay = OutboxRelay::new(engine.store.clone(), engine.bus.clone(), OutboxConfig::default());
    assert_eq!(relay.relay_once().await.unwrap(), 1);
    engine.drain().await;

    let patient_id = patient.id_typed();
    assert!(engine.models.get_patient(tenant_id, patient_id).await.unwrap().is_some());
    let journey = engine
        .models
        .find_open_by_patient(tenant_id, patient_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(journey.stage, JourneyStage::Lead);
    assert!(engine.store.get_unpublished(10).await.unwrap().is_empty());
    assert_eq!(relay.relay_once().await.unwrap(), 0);
}

#[tokio::test]
async fn read_models_rebuild_from_the_store() {
    let engine = engine();
    let tenant_id = TenantId::new();

    let (patient_id, _) = engine.register_patient(&EventContext::new(tenant_id)).await;
    engine.inbound_message(&EventContext::new(tenant_id), patient_id).await;
    engine.drain().await;
    engine.schedule(&EventContext::new(tenant_id), patient_id).await;
    engine.drain().await;

    let before = engine.models.journeys(tenant_id).unwrap();
    engine.models.clear_tenant(tenant_id).unwrap();
    assert!(engine.models.journeys(tenant_id).unwrap().is_empty());

    let handlers: Vec<Arc<dyn EventHandler>> = projections::all(engine.models.clone())
        .into_iter()
        .map(|(_, handler)| handler)
        .collect();
    let report = projections::replay_tenant(engine.store.as_ref(), &handlers, tenant_id)
        .await
        .unwrap();

    assert_eq!(report.events_read as usize, engine.store.len());
    assert_eq!(engine.models.journeys(tenant_id).unwrap(), before);
    assert_eq!(engine.models.appointments(tenant_id).unwrap().len(), 1);
    assert_eq!(before[0].stage, JourneyStage::Scheduled);
}
