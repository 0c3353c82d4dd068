use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use clinicflow_core::{AggregateId, ClinicId, CorrelationId, TenantId, UserId};

use crate::context::EventContext;
use crate::event::{Event, decode_event_data, encode_event_data};

/// Free-form metadata attached to an event.
pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Envelope carrying an untyped JSON payload.
///
/// This is the unit the event store persists and the bus transports.
pub type DomainEvent = EventEnvelope<JsonValue>;

/// Stream position and tracing metadata of one event.
///
/// Notes:
/// - **Multi-tenancy**: `tenant_id` / `clinic_id` are carried, not enforced.
/// - **Ordering**: `aggregate_version` starts at 1 and is contiguous per
///   `(aggregate_type, aggregate_id)`.
/// - `created_at` is when the event was recorded, not when it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub aggregate_version: u64,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<ClinicId>,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// Immutable event record: header plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    #[serde(flatten)]
    header: EventHeader,
    event_data: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(header: EventHeader, event_data: E) -> Self {
        Self { header, event_data }
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn event_id(&self) -> Uuid {
        self.header.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.header.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.header.aggregate_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.header.aggregate_id
    }

    pub fn aggregate_version(&self) -> u64 {
        self.header.aggregate_version
    }

    pub fn tenant_id(&self) -> TenantId {
        self.header.tenant_id
    }

    pub fn clinic_id(&self) -> Option<ClinicId> {
        self.header.clinic_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.header.correlation_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.header.causation_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.header.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.header.created_at
    }

    pub fn metadata(&self) -> Option<&JsonMap> {
        self.header.metadata.as_ref()
    }

    pub fn event_data(&self) -> &E {
        &self.event_data
    }

    pub fn into_parts(self) -> (EventHeader, E) {
        (self.header, self.event_data)
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Stamp a freshly produced event with a new id and the context metadata.
    pub fn record(
        ctx: &EventContext,
        aggregate_type: &str,
        aggregate_id: AggregateId,
        aggregate_version: u64,
        event_data: E,
    ) -> Self {
        let header = EventHeader {
            event_id: Uuid::now_v7(),
            event_type: event_data.event_type().to_string(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            aggregate_version,
            tenant_id: ctx.tenant_id(),
            clinic_id: ctx.clinic_id(),
            correlation_id: ctx.correlation_id(),
            causation_id: ctx.causation_id(),
            user_id: ctx.user_id(),
            created_at: Utc::now(),
            metadata: ctx.metadata().cloned(),
        };
        Self { header, event_data }
    }

    /// Erase the payload type for storage and transport.
    pub fn to_domain_event(&self) -> Result<DomainEvent, serde_json::Error> {
        Ok(EventEnvelope {
            header: self.header.clone(),
            event_data: encode_event_data(&self.event_data)?,
        })
    }
}

impl DomainEvent {
    /// Decode the payload as `E`.
    ///
    /// `Ok(None)` means `E` does not know this `event_type`.
    pub fn decode<E: Event>(&self) -> Result<Option<EventEnvelope<E>>, serde_json::Error> {
        let decoded = decode_event_data::<E>(&self.header.event_type, &self.event_data)?;
        Ok(decoded.map(|event_data| EventEnvelope {
            header: self.header.clone(),
            event_data,
        }))
    }

    /// Read a string field from the payload (e.g. `"patient_id"`).
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.event_data.get(field).and_then(JsonValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged {
        count: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "event_type", content = "event_data")]
    enum TestEvent {
        Pinged(Pinged),
    }

    impl Event for TestEvent {
        const EVENT_TYPES: &'static [&'static str] = &["Pinged"];

        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Pinged(_) => "Pinged",
            }
        }
    }

    fn test_context() -> EventContext {
        EventContext::new(TenantId::new()).with_user(UserId::new())
    }

    #[test]
    fn record_stamps_context_and_type() {
        let ctx = test_context();
        let id = AggregateId::new();
        let env = EventEnvelope::record(&ctx, "Pinger", id, 1, TestEvent::Pinged(Pinged { count: 3 }));

        assert_eq!(env.event_type(), "Pinged");
        assert_eq!(env.aggregate_type(), "Pinger");
        assert_eq!(env.aggregate_id(), id);
        assert_eq!(env.aggregate_version(), 1);
        assert_eq!(env.tenant_id(), ctx.tenant_id());
        assert_eq!(env.correlation_id(), ctx.correlation_id());
        assert_eq!(env.user_id(), ctx.user_id());
        assert_eq!(env.causation_id(), None);
    }

    #[test]
    fn domain_event_payload_is_the_variant_body() {
        let env = EventEnvelope::record(
            &test_context(),
            "Pinger",
            AggregateId::new(),
            1,
            TestEvent::Pinged(Pinged { count: 7 }),
        );
        let raw = env.to_domain_event().unwrap();

        assert_eq!(raw.event_type(), "Pinged");
        assert_eq!(raw.event_data(), &serde_json::json!({ "count": 7 }));

        let typed = raw.decode::<TestEvent>().unwrap().expect("known type");
        assert_eq!(typed.event_data(), env.event_data());
        assert_eq!(typed.event_id(), env.event_id());
    }

    #[test]
    fn unknown_event_type_decodes_to_none() {
        let env = EventEnvelope::record(
            &test_context(),
            "Pinger",
            AggregateId::new(),
            1,
            TestEvent::Pinged(Pinged { count: 1 }),
        );
        let mut raw = env.to_domain_event().unwrap();
        raw.header.event_type = "Ponged".to_string();

        assert!(raw.decode::<TestEvent>().unwrap().is_none());
    }

    #[test]
    fn wire_format_is_flat() {
        let env = EventEnvelope::record(
            &test_context(),
            "Pinger",
            AggregateId::new(),
            2,
            TestEvent::Pinged(Pinged { count: 1 }),
        );
        let raw = env.to_domain_event().unwrap();
        let json = serde_json::to_value(&raw).unwrap();

        assert_eq!(json["event_type"], "Pinged");
        assert_eq!(json["aggregate_version"], 2);
        assert_eq!(json["event_data"]["count"], 1);
        assert!(json.get("clinic_id").is_none());

        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, raw);
    }
}
