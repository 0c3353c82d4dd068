//! Patients domain module (event-sourced).
//!
//! Registration and contact details. `PatientId` is shared by every other
//! clinic aggregate that refers to a patient.

pub mod patient;

pub use patient::{
    AcquisitionSource, Patient, PatientContactUpdated, PatientEvent, PatientId, PatientRegistered, RegisterPatient,
};
