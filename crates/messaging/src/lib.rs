//! Patient conversations (inbound/outbound messages) as an event-sourced aggregate.

pub mod conversation;

pub use conversation::{
    Channel, Conversation, ConversationClosed, ConversationEvent, ConversationId, ConversationStarted,
    ConversationStatus, MessageReceived, MessageSent,
};
