//! Appointment scheduling domain module (event-sourced).
//!
//! Pure domain logic: no IO, no storage. Every appointment event carries the
//! `patient_id` so downstream consumers can route by patient.

pub mod appointment;

pub use appointment::{
    Appointment, AppointmentCancelled, AppointmentCompleted, AppointmentConfirmed, AppointmentEvent, AppointmentId,
    AppointmentNoShow, AppointmentRescheduled, AppointmentScheduled, AppointmentStatus, ScheduleAppointment,
};
