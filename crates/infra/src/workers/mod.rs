//! Long-running background tasks: the event consumer and the outbox relay.
//!
//! Both run as tokio tasks and stop on a shared `watch` shutdown signal after
//! finishing the delivery or batch in hand.

pub mod backoff;
pub mod event_consumer;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub use backoff::Backoff;
pub use event_consumer::{ConsumerConfig, ConsumerStats, EventConsumer, Outcome};

/// Handle to stop and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(worker = self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}

/// Resolves once `shutdown` flips to `true` or its sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
