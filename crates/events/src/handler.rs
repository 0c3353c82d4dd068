use async_trait::async_trait;

use crate::envelope::DomainEvent;

/// A consumer of published events (projection, process manager, ...).
///
/// Handlers see every delivery of an event, including redeliveries, so
/// `handle` must be idempotent. An error sends the whole message to the
/// dead-letter queue; it is not retried against this handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and dead-letter reasons.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}
