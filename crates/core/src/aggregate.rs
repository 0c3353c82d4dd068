//! Aggregate root traits for event-sourced domain models.

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events this instance has applied (its stream revision).
    ///
    /// Zero means the aggregate has not been created yet.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Event application semantics (pure, deterministic).
///
/// Command methods live on the concrete aggregate: they validate against the
/// current state and describe what happened as an event. `apply` is the only
/// place state changes, both for freshly recorded events and during replay.
///
/// Aggregates must not perform IO. Version bookkeeping is owned by the event
/// log the aggregate carries, so `apply` only touches business fields.
pub trait Aggregate: AggregateRoot {
    /// Stable aggregate type name stored alongside every event
    /// (e.g. `"Appointment"`).
    const AGGREGATE_TYPE: &'static str;

    type Event: Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);
}
