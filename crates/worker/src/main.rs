//! clinicflow worker: consumes the event bus, keeps read models current,
//! drives patient journeys and relays unpublished events.
//!
//! Backends come from the environment (see `clinicflow_infra::config`):
//! Postgres for the store and read models when `DATABASE_URL` is set, Redis
//! Streams for the bus when `REDIS_URL` is set, in-memory otherwise.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use clinicflow_events::{EventBus, InMemoryEventBus, MessageSource, RoutingTable};
use clinicflow_infra::command_dispatcher::CommandDispatcher;
use clinicflow_infra::config::EngineConfig;
use clinicflow_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use clinicflow_infra::outbox::OutboxRelay;
use clinicflow_infra::process_manager::PatientJourneyProcessManager;
use clinicflow_infra::projections;
use clinicflow_infra::read_model::{
    AppointmentReadModel, ConversationReadModel, InMemoryReadModels, JourneyReadModel, PatientReadModel,
    PostgresReadModels,
};
use clinicflow_infra::schema;
use clinicflow_infra::workers::{ConsumerConfig, EventConsumer};

/// Read-model backend serving every projection and the process manager.
trait ReadModels: AppointmentReadModel + PatientReadModel + ConversationReadModel + JourneyReadModel + 'static {}

impl<T> ReadModels for T where T: AppointmentReadModel + PatientReadModel + ConversationReadModel + JourneyReadModel + 'static {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clinicflow_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPool::connect(&url).await.context("failed to connect to Postgres")?;
            schema::apply(&pool).await.context("failed to apply schema")?;
            info!("using Postgres event store and read models");
            let store = Arc::new(PostgresEventStore::new(pool.clone()));
            let models = Arc::new(PostgresReadModels::new(pool));
            with_bus(config, store, models).await
        }
        None => {
            warn!("DATABASE_URL not set; events and read models live in memory only");
            with_bus(config, Arc::new(InMemoryEventStore::new()), Arc::new(InMemoryReadModels::new())).await
        }
    }
}

async fn with_bus<S, R>(config: EngineConfig, store: S, models: Arc<R>) -> anyhow::Result<()>
where
    S: EventStore + Clone + 'static,
    R: ReadModels,
{
    #[cfg(feature = "redis")]
    {
        if let Some(url) = config.redis_url.clone() {
            let bus = clinicflow_infra::event_bus::RedisStreamsEventBus::connect(config.redis_streams(&url))
                .await
                .context("failed to connect to Redis")?;
            info!(stream = %config.broker.stream_key, group = %config.broker.consumer_group, "using Redis Streams bus");
            return serve(config, store, Arc::new(bus), models).await;
        }
    }

    #[cfg(not(feature = "redis"))]
    {
        if config.redis_url.is_some() {
            warn!("REDIS_URL is set but the worker was built without the `redis` feature");
        }
    }

    warn!("using in-memory bus; nothing outside this process can publish to it");
    serve(config, store, Arc::new(InMemoryEventBus::new()), models).await
}

async fn serve<S, B, R>(config: EngineConfig, store: S, bus: B, models: Arc<R>) -> anyhow::Result<()>
where
    S: EventStore + Clone + 'static,
    B: EventBus + MessageSource + Clone + 'static,
    R: ReadModels,
{
    let dispatcher = Arc::new(
        CommandDispatcher::new(store.clone(), bus.clone()).with_max_retries(config.max_command_retries),
    );
    let journey_pm = Arc::new(PatientJourneyProcessManager::new(dispatcher, models.clone(), models.clone()));

    let routes = projections::subscribe(RoutingTable::builder(), models)
        .subscribe_many(PatientJourneyProcessManager::<S, B>::EVENT_TYPES.iter().copied(), journey_pm)
        .build();
    info!(?routes, "routing table built");

    let consumer = EventConsumer::new(bus.clone(), routes, ConsumerConfig::default().with_name("clinicflow-worker"));
    let stats = consumer.stats_handle();
    let consumer = consumer.spawn();
    let relay = OutboxRelay::new(store, bus, config.outbox.clone()).spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    consumer.shutdown().await;
    relay.shutdown().await;

    if let Ok(stats) = stats.lock() {
        info!(
            delivered = stats.delivered,
            acked = stats.acked,
            dead_lettered = stats.dead_lettered,
            "worker stopped"
        );
    }
    Ok(())
}
