//! Append-only event store boundary.
//!
//! Streams are keyed by `(aggregate_type, aggregate_id)` and carry contiguous
//! versions starting at 1. Both backends enforce the same rules; the Postgres
//! one relies on a unique constraint, the in-memory one on a write lock.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, Pagination};
