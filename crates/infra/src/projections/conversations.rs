//! Conversation inbox projection.
//!
//! `message_count` is deduplicated by event id, so a redelivered
//! `MessageReceived` or `MessageSent` never moves it twice.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tracing::debug;

use clinicflow_events::{DomainEvent, Event, EventHandler};
use clinicflow_messaging::{ConversationEvent, ConversationId, ConversationStatus};

use crate::read_model::{ConversationReadModel, ConversationView};

pub struct ConversationsProjection {
    store: Arc<dyn ConversationReadModel>,
}

impl ConversationsProjection {
    pub const EVENT_TYPES: &'static [&'static str] = ConversationEvent::EVENT_TYPES;

    pub fn new(store: Arc<dyn ConversationReadModel>) -> Self {
        Self { store }
    }

    pub async fn apply_envelope(&self, envelope: &DomainEvent) -> anyhow::Result<()> {
        let Some(event) = envelope.decode::<ConversationEvent>()? else {
            return Ok(());
        };
        let tenant_id = event.tenant_id();

        match event.event_data() {
            ConversationEvent::ConversationStarted(e) => {
                self.store
                    .insert_conversation(
                        tenant_id,
                        ConversationView {
                            conversation_id: e.conversation_id,
                            patient_id: e.patient_id,
                            channel: e.channel,
                            status: ConversationStatus::Open,
                            message_count: 0,
                            last_message_at: None,
                        },
                    )
                    .await?;
                Ok(())
            }
            ConversationEvent::MessageReceived(e) => self.count(envelope, e.conversation_id).await,
            ConversationEvent::MessageSent(e) => self.count(envelope, e.conversation_id).await,
            ConversationEvent::ConversationClosed(e) => {
                let found = self
                    .store
                    .set_conversation_status(tenant_id, e.conversation_id, ConversationStatus::Closed)
                    .await?;
                if !found {
                    bail!("conversation {} not projected yet", e.conversation_id);
                }
                Ok(())
            }
        }
    }

    async fn count(&self, envelope: &DomainEvent, conversation_id: ConversationId) -> anyhow::Result<()> {
        let tenant_id = envelope.tenant_id();
        let counted = self
            .store
            .record_message(tenant_id, conversation_id, envelope.event_id(), envelope.created_at())
            .await?;
        if counted {
            return Ok(());
        }

        if self.store.get_conversation(tenant_id, conversation_id).await?.is_none() {
            bail!("conversation {conversation_id} not projected yet");
        }
        debug!(event_id = %envelope.event_id(), "message already counted");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ConversationsProjection {
    fn name(&self) -> &'static str {
        "conversations_projection"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        self.apply_envelope(event).await
    }
}
