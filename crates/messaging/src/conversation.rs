use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clinicflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, UserId};
use clinicflow_events::{Event, EventContext, EventLog, EventSourced};
use clinicflow_patients::PatientId;

const MAX_BODY_LEN: usize = 4096;

/// Conversation identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub AggregateId);

impl ConversationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Sms,
    Email,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
        }
    }
}

/// Event: ConversationStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStarted {
    pub conversation_id: ConversationId,
    pub patient_id: PatientId,
    pub channel: Channel,
}

/// Event: MessageReceived (inbound, from the patient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub conversation_id: ConversationId,
    pub patient_id: PatientId,
    pub message_id: Uuid,
    pub body: String,
}

/// Event: MessageSent (outbound, from clinic staff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSent {
    pub conversation_id: ConversationId,
    pub patient_id: PatientId,
    pub message_id: Uuid,
    pub body: String,
    pub sent_by: Option<UserId>,
}

/// Event: ConversationClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationClosed {
    pub conversation_id: ConversationId,
    pub patient_id: PatientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "event_data")]
pub enum ConversationEvent {
    ConversationStarted(ConversationStarted),
    MessageReceived(MessageReceived),
    MessageSent(MessageSent),
    ConversationClosed(ConversationClosed),
}

impl Event for ConversationEvent {
    const EVENT_TYPES: &'static [&'static str] =
        &["ConversationStarted", "MessageReceived", "MessageSent", "ConversationClosed"];

    fn event_type(&self) -> &'static str {
        match self {
            ConversationEvent::ConversationStarted(_) => "ConversationStarted",
            ConversationEvent::MessageReceived(_) => "MessageReceived",
            ConversationEvent::MessageSent(_) => "MessageSent",
            ConversationEvent::ConversationClosed(_) => "ConversationClosed",
        }
    }
}

/// Aggregate root: Conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: ConversationId,
    patient_id: Option<PatientId>,
    channel: Option<Channel>,
    status: ConversationStatus,
    inbound_count: u64,
    outbound_count: u64,
    log: EventLog<ConversationEvent>,
}

impl Conversation {
    /// Create an empty, not-yet-started aggregate instance for rehydration.
    pub fn empty(id: ConversationId) -> Self {
        Self {
            id,
            patient_id: None,
            channel: None,
            status: ConversationStatus::Open,
            inbound_count: 0,
            outbound_count: 0,
            log: EventLog::new(),
        }
    }

    pub fn start(ctx: &EventContext, id: ConversationId, patient_id: PatientId, channel: Channel) -> Self {
        let mut conversation = Self::empty(id);
        conversation.record(
            ctx,
            ConversationEvent::ConversationStarted(ConversationStarted {
                conversation_id: id,
                patient_id,
                channel,
            }),
        );
        conversation
    }

    /// Record an inbound message. Returns the generated message id.
    pub fn receive_message(&mut self, ctx: &EventContext, body: &str) -> DomainResult<Uuid> {
        let patient_id = self.ensure_open()?;
        let body = validate_body(body)?;
        let message_id = Uuid::now_v7();

        self.record(
            ctx,
            ConversationEvent::MessageReceived(MessageReceived {
                conversation_id: self.id,
                patient_id,
                message_id,
                body,
            }),
        );
        Ok(message_id)
    }

    /// Record an outbound message. Returns the generated message id.
    pub fn send_message(&mut self, ctx: &EventContext, body: &str) -> DomainResult<Uuid> {
        let patient_id = self.ensure_open()?;
        let body = validate_body(body)?;
        let message_id = Uuid::now_v7();

        self.record(
            ctx,
            ConversationEvent::MessageSent(MessageSent {
                conversation_id: self.id,
                patient_id,
                message_id,
                body,
                sent_by: ctx.user_id(),
            }),
        );
        Ok(message_id)
    }

    pub fn close(&mut self, ctx: &EventContext) -> DomainResult<()> {
        let patient_id = self.ensure_open()?;

        self.record(
            ctx,
            ConversationEvent::ConversationClosed(ConversationClosed {
                conversation_id: self.id,
                patient_id,
            }),
        );
        Ok(())
    }

    pub fn id_typed(&self) -> ConversationId {
        self.id
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn message_count(&self) -> u64 {
        self.inbound_count + self.outbound_count
    }

    pub fn inbound_count(&self) -> u64 {
        self.inbound_count
    }

    fn ensure_open(&self) -> DomainResult<PatientId> {
        let patient_id = self.patient_id.ok_or_else(DomainError::not_found)?;
        if self.status == ConversationStatus::Closed {
            return Err(DomainError::invariant("conversation is closed"));
        }
        Ok(patient_id)
    }
}

fn validate_body(body: &str) -> DomainResult<String> {
    let body = body.trim();
    if body.is_empty() {
        return Err(DomainError::validation("message body cannot be empty"));
    }
    if body.len() > MAX_BODY_LEN {
        return Err(DomainError::validation(format!(
            "message body exceeds {MAX_BODY_LEN} bytes"
        )));
    }
    Ok(body.to_string())
}

impl AggregateRoot for Conversation {
    type Id = ConversationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.log.version()
    }
}

impl Aggregate for Conversation {
    const AGGREGATE_TYPE: &'static str = "Conversation";
    type Event = ConversationEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ConversationEvent::ConversationStarted(e) => {
                self.patient_id = Some(e.patient_id);
                self.channel = Some(e.channel);
                self.status = ConversationStatus::Open;
            }
            ConversationEvent::MessageReceived(_) => {
                self.inbound_count += 1;
            }
            ConversationEvent::MessageSent(_) => {
                self.outbound_count += 1;
            }
            ConversationEvent::ConversationClosed(_) => {
                self.status = ConversationStatus::Closed;
            }
        }
    }
}

impl EventSourced for Conversation {
    fn aggregate_id(&self) -> AggregateId {
        self.id.0
    }

    fn event_log(&self) -> &EventLog<ConversationEvent> {
        &self.log
    }

    fn event_log_mut(&mut self) -> &mut EventLog<ConversationEvent> {
        &mut self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicflow_core::TenantId;
    use proptest::prelude::*;

    fn test_ctx() -> EventContext {
        EventContext::new(TenantId::new())
    }

    fn started(ctx: &EventContext) -> Conversation {
        Conversation::start(
            ctx,
            ConversationId::new(AggregateId::new()),
            PatientId::new(AggregateId::new()),
            Channel::Whatsapp,
        )
    }

    #[test]
    fn start_opens_conversation() {
        let convo = started(&test_ctx());
        assert_eq!(convo.version(), 1);
        assert_eq!(convo.status(), ConversationStatus::Open);
        assert_eq!(convo.channel(), Some(Channel::Whatsapp));
        assert_eq!(convo.uncommitted()[0].event_type(), "ConversationStarted");
    }

    #[test]
    fn messages_are_counted_by_direction() {
        let ctx = test_ctx().with_user(UserId::new());
        let mut convo = started(&ctx);
        convo.receive_message(&ctx, "Hi, do you have slots on Friday?").unwrap();
        convo.send_message(&ctx, "Yes, 10am works.").unwrap();
        convo.receive_message(&ctx, "Great").unwrap();

        assert_eq!(convo.inbound_count(), 2);
        assert_eq!(convo.message_count(), 3);

        match convo.uncommitted()[2].event_data() {
            ConversationEvent::MessageSent(e) => assert_eq!(e.sent_by, ctx.user_id()),
            other => panic!("Expected MessageSent, got {other:?}"),
        }
    }

    #[test]
    fn blank_message_is_rejected() {
        let ctx = test_ctx();
        let mut convo = started(&ctx);
        assert!(matches!(
            convo.receive_message(&ctx, "   "),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(convo.version(), 1);
    }

    #[test]
    fn closed_conversation_rejects_messages() {
        let ctx = test_ctx();
        let mut convo = started(&ctx);
        convo.close(&ctx).unwrap();

        assert_eq!(convo.status(), ConversationStatus::Closed);
        assert!(matches!(
            convo.send_message(&ctx, "hello?"),
            Err(DomainError::InvariantViolation(_))
        ));
        assert!(convo.close(&ctx).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: N accepted messages leave the conversation at version N + 1
        /// and replay rebuilds the same counters.
        #[test]
        fn replay_rebuilds_counters(inbound in prop::collection::vec(any::<bool>(), 0..20)) {
            let ctx = test_ctx();
            let mut live = started(&ctx);
            for is_inbound in &inbound {
                if *is_inbound {
                    live.receive_message(&ctx, "ping").unwrap();
                } else {
                    live.send_message(&ctx, "pong").unwrap();
                }
            }

            prop_assert_eq!(live.version(), inbound.len() as u64 + 1);

            let history = live.take_uncommitted();
            let mut replayed = Conversation::empty(live.id_typed());
            replayed.load_from_history(history).unwrap();

            prop_assert_eq!(replayed.message_count(), live.message_count());
            prop_assert_eq!(replayed.inbound_count(), live.inbound_count());
            prop_assert_eq!(replayed.version(), live.version());
        }
    }
}
