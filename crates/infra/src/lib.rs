//! Infrastructure layer: event stores, buses, read models, projections,
//! the patient journey process manager and the workers that run them.

pub mod command_dispatcher;
pub mod config;
pub mod event_bus;
pub mod event_store;
pub mod outbox;
pub mod process_manager;
pub mod projections;
pub mod read_model;
pub mod schema;
pub mod workers;

#[cfg(test)]
mod integration_tests;
