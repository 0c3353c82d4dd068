//! Process managers: handlers that turn events into commands.

pub mod patient_journey;

pub use patient_journey::{PatientJourneyProcessManager, ProcessManagerError};
