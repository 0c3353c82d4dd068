//! Outbox relay: republishes stored-but-unpublished events.
//!
//! The dispatcher appends, then publishes. If the bus is down in between,
//! the events sit in the store with no publication mark. The relay polls
//! for them oldest first, publishes, and marks what went out. Consumers may
//! see an event twice when a mark is lost; handlers are idempotent.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use clinicflow_events::{BusError, EventBus};

use crate::event_store::{EventStore, EventStoreError};
use crate::workers::{Backoff, WorkerHandle, shutdown_requested};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub max_backoff: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            batch_size: 100,
            max_backoff: Duration::from_secs(30),
        }
    }
}

pub struct OutboxRelay<S, B> {
    store: S,
    bus: B,
    config: OutboxConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: EventStore + 'static,
    B: EventBus + 'static,
{
    pub fn new(store: S, bus: B, config: OutboxConfig) -> Self {
        Self { store, bus, config }
    }

    /// Publish one batch. Stops at the first publish failure, still marking
    /// the events that made it out.
    pub async fn relay_once(&self) -> Result<usize, OutboxError> {
        let batch = self.store.get_unpublished(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut published = Vec::with_capacity(batch.len());
        let mut failure = None;
        for event in &batch {
            match self.bus.publish(event).await {
                Ok(()) => published.push(event.event_id()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.store.mark_published(&published).await?;
        debug!(published = published.len(), batch = batch.len(), "outbox batch relayed");

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(published.len()),
        }
    }

    /// Poll every `interval` until `shutdown` fires. A full batch is followed
    /// by another immediately; failures back off.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.interval, self.config.max_backoff.max(self.config.interval));
        info!("outbox relay started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.relay_once().await {
                Ok(n) if n as u32 >= self.config.batch_size => {
                    backoff.reset();
                    continue;
                }
                Ok(n) => {
                    if n > 0 {
                        info!(published = n, "outbox relayed events");
                    }
                    backoff.reset();
                    self.config.interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "outbox relay failed");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!("outbox relay stopped");
    }

    pub fn spawn(self) -> WorkerHandle {
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(self.run(rx));
        WorkerHandle::new("outbox-relay", tx, join)
    }
}
