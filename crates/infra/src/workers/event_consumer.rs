//! Queue consumer: takes deliveries, fans them out, settles them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use clinicflow_events::{BusError, Delivery, MessageSource, RoutingTable};

use super::backoff::Backoff;
use super::{WorkerHandle, shutdown_requested};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name for logging.
    pub name: &'static str,
    /// How long one read waits for a message before re-checking shutdown.
    pub poll_wait: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "event-consumer",
            poll_wait: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub source_errors: u64,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    DeadLettered { reason: String },
}

/// Pulls from a [`MessageSource`] and runs every routed handler.
///
/// All handlers succeeded: ack. Any handler failed: the whole message goes to
/// the dead-letter queue with every failure in the reason, and no handler is
/// retried in place.
///
/// A settlement the source refused (ack or dead-letter during an outage) is
/// kept and retried before the next read, so handlers do not run twice and
/// the delivery does not sit unsettled.
pub struct EventConsumer<S> {
    source: S,
    routes: Arc<RoutingTable>,
    config: ConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
    unsettled: Mutex<Option<(Delivery, Outcome)>>,
}

impl<S> EventConsumer<S>
where
    S: MessageSource + 'static,
{
    pub fn new(source: S, routes: Arc<RoutingTable>, config: ConsumerConfig) -> Self {
        Self {
            source,
            routes,
            config,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
            unsettled: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Shared view of the counters, readable after `spawn`.
    pub fn stats_handle(&self) -> Arc<Mutex<ConsumerStats>> {
        self.stats.clone()
    }

    /// Take at most one delivery and settle it. `Ok(None)` when the queue
    /// stayed empty for `poll_wait`.
    pub async fn process_one(&self) -> Result<Option<Outcome>, BusError> {
        let retry = self.unsettled.lock().ok().and_then(|mut slot| slot.take());
        if let Some((delivery, outcome)) = retry {
            debug!(consumer = self.config.name, tag = %delivery.tag, "retrying settlement");
            return self.settle(delivery, outcome).await.map(Some);
        }

        let Some(delivery) = self.source.next_delivery(self.config.poll_wait).await? else {
            return Ok(None);
        };
        self.bump(|s| {
            s.delivered += 1;
            if delivery.redelivered {
                s.redelivered += 1;
            }
        });
        debug!(
            consumer = self.config.name,
            event_id = %delivery.event.event_id(),
            event_type = delivery.event.event_type(),
            redelivered = delivery.redelivered,
            "delivery received"
        );

        let failures = self.routes.dispatch(&delivery.event).await;
        let outcome = if failures.is_empty() {
            Outcome::Acked
        } else {
            let reason = failures
                .iter()
                .map(|f| format!("{}: {:#}", f.handler, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            Outcome::DeadLettered { reason }
        };
        self.settle(delivery, outcome).await.map(Some)
    }

    async fn settle(&self, delivery: Delivery, outcome: Outcome) -> Result<Outcome, BusError> {
        let settled = match &outcome {
            Outcome::Acked => self.source.ack(&delivery).await,
            Outcome::DeadLettered { reason } => self.source.dead_letter(&delivery, reason).await,
        };
        if let Err(e) = settled {
            warn!(
                consumer = self.config.name,
                tag = %delivery.tag,
                error = %e,
                "settlement failed, kept for retry"
            );
            if let Ok(mut slot) = self.unsettled.lock() {
                *slot = Some((delivery, outcome));
            }
            return Err(e);
        }

        match &outcome {
            Outcome::Acked => self.bump(|s| s.acked += 1),
            Outcome::DeadLettered { reason } => {
                self.bump(|s| s.dead_lettered += 1);
                warn!(
                    consumer = self.config.name,
                    event_id = %delivery.event.event_id(),
                    event_type = delivery.event.event_type(),
                    %reason,
                    "delivery dead-lettered"
                );
            }
        }
        Ok(outcome)
    }

    /// Consume until `shutdown` fires. Source errors pause the loop with
    /// exponential backoff; the first successful read resets it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        info!(consumer = self.config.name, "event consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_one().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    self.bump(|s| s.source_errors += 1);
                    let delay = backoff.next_delay();
                    warn!(
                        consumer = self.config.name,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "message source unavailable, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }

        info!(consumer = self.config.name, "event consumer stopped");
    }

    /// Run on a tokio task.
    pub fn spawn(self) -> WorkerHandle {
        let (tx, rx) = watch::channel(false);
        let name = self.config.name;
        let join = tokio::spawn(self.run(rx));
        WorkerHandle::new(name, tx, join)
    }

    fn bump(&self, f: impl FnOnce(&mut ConsumerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
