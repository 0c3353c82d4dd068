//! Immutable event-type → handler routing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::envelope::DomainEvent;
use crate::handler::EventHandler;

/// A handler that returned an error for one event.
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub error: anyhow::Error,
}

/// Collects subscriptions at startup.
#[derive(Default)]
pub struct RoutingTableBuilder {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `event_type` to `handler`. A type may have many handlers; they
    /// run in subscription order.
    pub fn subscribe(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.by_type.entry(event_type.into()).or_default().push(handler);
        self
    }

    /// Route several event types to the same handler.
    pub fn subscribe_many<I, S>(mut self, event_types: I, handler: Arc<dyn EventHandler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for event_type in event_types {
            self = self.subscribe(event_type, handler.clone());
        }
        self
    }

    /// Route every event type to `handler`, after the type-specific handlers.
    pub fn subscribe_all(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.catch_all.push(handler);
        self
    }

    pub fn build(self) -> Arc<RoutingTable> {
        Arc::new(RoutingTable {
            by_type: self.by_type,
            catch_all: self.catch_all,
        })
    }
}

/// Frozen routing table shared by consumers.
pub struct RoutingTable {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::new()
    }

    pub fn handlers_for(&self, event_type: &str) -> impl Iterator<Item = &Arc<dyn EventHandler>> {
        self.by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
    }

    pub fn is_routed(&self, event_type: &str) -> bool {
        self.handlers_for(event_type).next().is_some()
    }

    /// Run every handler for the event. A failing handler does not stop the
    /// others; all failures are returned.
    pub async fn dispatch(&self, event: &DomainEvent) -> Vec<HandlerFailure> {
        let mut failures = Vec::new();
        for handler in self.handlers_for(event.event_type()) {
            if let Err(error) = handler.handle(event).await {
                tracing::warn!(
                    handler = handler.name(),
                    event_id = %event.event_id(),
                    event_type = event.event_type(),
                    error = %error,
                    "event handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name(),
                    error,
                });
            }
        }
        failures
    }
}

impl core::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<&String> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("RoutingTable")
            .field("event_types", &types)
            .field("catch_all", &self.catch_all.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use clinicflow_core::{AggregateId, CorrelationId, TenantId};
    use uuid::Uuid;

    use crate::envelope::{EventEnvelope, EventHeader};

    struct Recorder {
        name: &'static str,
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.event_type().to_string());
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    fn test_event(event_type: &str) -> DomainEvent {
        EventEnvelope::new(
            EventHeader {
                event_id: Uuid::now_v7(),
                event_type: event_type.to_string(),
                aggregate_type: "Test".to_string(),
                aggregate_id: AggregateId::new(),
                aggregate_version: 1,
                tenant_id: TenantId::new(),
                clinic_id: None,
                correlation_id: CorrelationId::new(),
                causation_id: None,
                user_id: None,
                created_at: Utc::now(),
                metadata: None,
            },
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn routes_only_subscribed_types() {
        let a = Recorder::new("a", false);
        let table = RoutingTable::builder().subscribe("Pinged", a.clone()).build();

        assert!(table.dispatch(&test_event("Pinged")).await.is_empty());
        assert!(table.dispatch(&test_event("Ponged")).await.is_empty());

        assert_eq!(a.seen(), vec!["Pinged".to_string()]);
        assert!(!table.is_routed("Ponged"));
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bad = Recorder::new("bad", true);
        let good = Recorder::new("good", false);
        let all = Recorder::new("all", false);
        let table = RoutingTable::builder()
            .subscribe("Pinged", bad.clone())
            .subscribe("Pinged", good.clone())
            .subscribe_all(all.clone())
            .build();

        let failures = table.dispatch(&test_event("Pinged")).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].handler, "bad");
        assert_eq!(good.seen().len(), 1);
        assert_eq!(all.seen().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_many_registers_each_type() {
        let h = Recorder::new("h", false);
        let table = RoutingTable::builder()
            .subscribe_many(["Pinged", "Ponged"], h.clone())
            .build();

        table.dispatch(&test_event("Pinged")).await;
        table.dispatch(&test_event("Ponged")).await;

        assert_eq!(h.seen(), vec!["Pinged".to_string(), "Ponged".to_string()]);
    }
}
