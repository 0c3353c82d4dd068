//! `clinicflow-events`: event-sourcing mechanics (no business rules, no IO).
//!
//! - the immutable event record ([`EventEnvelope`] / [`DomainEvent`])
//! - the per-aggregate event log and replay ([`EventSourced`])
//! - bus, handler and routing abstractions used by infrastructure

pub mod bus;
pub mod context;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod routing;
pub mod sourced;

pub use bus::{BusError, Delivery, EventBus, MessageSource};
pub use context::EventContext;
pub use envelope::{DomainEvent, EventEnvelope, EventHeader, JsonMap};
pub use event::Event;
pub use handler::EventHandler;
pub use in_memory_bus::{DeadLetter, InMemoryEventBus};
pub use routing::{HandlerFailure, RoutingTable, RoutingTableBuilder};
pub use sourced::{EventLog, EventSourced, ReplayError};
