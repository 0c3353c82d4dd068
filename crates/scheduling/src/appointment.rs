use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clinicflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, UserId};
use clinicflow_events::{Event, EventContext, EventLog, EventSourced};
use clinicflow_patients::PatientId;

/// Longest appointment slot accepted, in minutes.
const MAX_DURATION_MINUTES: u32 = 8 * 60;

/// Appointment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentId(pub AggregateId);

impl AppointmentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AppointmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Appointment status lifecycle.
///
/// `scheduled → confirmed → completed`, with `cancelled` and `no_show` as the
/// other terminal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Still on the calendar (not yet resolved).
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed)
    }
}

/// Command input: ScheduleAppointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleAppointment {
    pub patient_id: PatientId,
    pub practitioner_id: Option<UserId>,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

/// Event: AppointmentScheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentScheduled {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
    pub practitioner_id: Option<UserId>,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

/// Event: AppointmentConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentConfirmed {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
}

/// Event: AppointmentRescheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRescheduled {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
    pub previous_starts_at: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

/// Event: AppointmentCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentCancelled {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
    pub reason: Option<String>,
}

/// Event: AppointmentCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentCompleted {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
}

/// Event: AppointmentNoShow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentNoShow {
    pub appointment_id: AppointmentId,
    pub patient_id: PatientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "event_data")]
pub enum AppointmentEvent {
    AppointmentScheduled(AppointmentScheduled),
    AppointmentConfirmed(AppointmentConfirmed),
    AppointmentRescheduled(AppointmentRescheduled),
    AppointmentCancelled(AppointmentCancelled),
    AppointmentCompleted(AppointmentCompleted),
    AppointmentNoShow(AppointmentNoShow),
}

impl Event for AppointmentEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "AppointmentScheduled",
        "AppointmentConfirmed",
        "AppointmentRescheduled",
        "AppointmentCancelled",
        "AppointmentCompleted",
        "AppointmentNoShow",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            AppointmentEvent::AppointmentScheduled(_) => "AppointmentScheduled",
            AppointmentEvent::AppointmentConfirmed(_) => "AppointmentConfirmed",
            AppointmentEvent::AppointmentRescheduled(_) => "AppointmentRescheduled",
            AppointmentEvent::AppointmentCancelled(_) => "AppointmentCancelled",
            AppointmentEvent::AppointmentCompleted(_) => "AppointmentCompleted",
            AppointmentEvent::AppointmentNoShow(_) => "AppointmentNoShow",
        }
    }
}

/// Aggregate root: Appointment.
#[derive(Debug, Clone)]
pub struct Appointment {
    id: AppointmentId,
    patient_id: Option<PatientId>,
    practitioner_id: Option<UserId>,
    starts_at: Option<DateTime<Utc>>,
    duration_minutes: u32,
    status: AppointmentStatus,
    cancellation_reason: Option<String>,
    created: bool,
    log: EventLog<AppointmentEvent>,
}

impl Appointment {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: AppointmentId) -> Self {
        Self {
            id,
            patient_id: None,
            practitioner_id: None,
            starts_at: None,
            duration_minutes: 0,
            status: AppointmentStatus::Scheduled,
            cancellation_reason: None,
            created: false,
            log: EventLog::new(),
        }
    }

    pub fn schedule(ctx: &EventContext, id: AppointmentId, cmd: ScheduleAppointment) -> DomainResult<Self> {
        validate_duration(cmd.duration_minutes)?;

        let mut appointment = Self::empty(id);
        appointment.record(
            ctx,
            AppointmentEvent::AppointmentScheduled(AppointmentScheduled {
                appointment_id: id,
                patient_id: cmd.patient_id,
                practitioner_id: cmd.practitioner_id,
                starts_at: cmd.starts_at,
                duration_minutes: cmd.duration_minutes,
            }),
        );
        Ok(appointment)
    }

    pub fn confirm(&mut self, ctx: &EventContext) -> DomainResult<()> {
        let patient_id = self.ensure_created()?;
        if self.status != AppointmentStatus::Scheduled {
            return Err(DomainError::invariant(format!(
                "cannot confirm a {} appointment",
                self.status.as_str()
            )));
        }

        self.record(
            ctx,
            AppointmentEvent::AppointmentConfirmed(AppointmentConfirmed {
                appointment_id: self.id,
                patient_id,
            }),
        );
        Ok(())
    }

    /// Move the slot. A confirmed appointment goes back to `scheduled` and
    /// needs confirming again.
    pub fn reschedule(&mut self, ctx: &EventContext, starts_at: DateTime<Utc>, duration_minutes: u32) -> DomainResult<()> {
        let patient_id = self.ensure_active("reschedule")?;
        validate_duration(duration_minutes)?;

        let previous_starts_at = self.starts_at.unwrap_or(starts_at);
        if previous_starts_at == starts_at && self.duration_minutes == duration_minutes {
            return Err(DomainError::validation("new slot is identical to the current one"));
        }

        self.record(
            ctx,
            AppointmentEvent::AppointmentRescheduled(AppointmentRescheduled {
                appointment_id: self.id,
                patient_id,
                previous_starts_at,
                starts_at,
                duration_minutes,
            }),
        );
        Ok(())
    }

    pub fn cancel(&mut self, ctx: &EventContext, reason: Option<String>) -> DomainResult<()> {
        let patient_id = self.ensure_active("cancel")?;
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());

        self.record(
            ctx,
            AppointmentEvent::AppointmentCancelled(AppointmentCancelled {
                appointment_id: self.id,
                patient_id,
                reason,
            }),
        );
        Ok(())
    }

    pub fn complete(&mut self, ctx: &EventContext) -> DomainResult<()> {
        let patient_id = self.ensure_active("complete")?;

        self.record(
            ctx,
            AppointmentEvent::AppointmentCompleted(AppointmentCompleted {
                appointment_id: self.id,
                patient_id,
            }),
        );
        Ok(())
    }

    pub fn mark_no_show(&mut self, ctx: &EventContext) -> DomainResult<()> {
        let patient_id = self.ensure_active("mark as no-show")?;

        self.record(
            ctx,
            AppointmentEvent::AppointmentNoShow(AppointmentNoShow {
                appointment_id: self.id,
                patient_id,
            }),
        );
        Ok(())
    }

    pub fn id_typed(&self) -> AppointmentId {
        self.id
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn practitioner_id(&self) -> Option<UserId> {
        self.practitioner_id
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.starts_at
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn status(&self) -> AppointmentStatus {
        self.status
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    fn ensure_created(&self) -> DomainResult<PatientId> {
        match (self.created, self.patient_id) {
            (true, Some(patient_id)) => Ok(patient_id),
            _ => Err(DomainError::not_found()),
        }
    }

    fn ensure_active(&self, action: &str) -> DomainResult<PatientId> {
        let patient_id = self.ensure_created()?;
        if !self.status.is_active() {
            return Err(DomainError::invariant(format!(
                "cannot {action} a {} appointment",
                self.status.as_str()
            )));
        }
        Ok(patient_id)
    }
}

fn validate_duration(minutes: u32) -> DomainResult<()> {
    if minutes == 0 || minutes > MAX_DURATION_MINUTES {
        return Err(DomainError::validation(format!(
            "duration_minutes must be between 1 and {MAX_DURATION_MINUTES}"
        )));
    }
    Ok(())
}

impl AggregateRoot for Appointment {
    type Id = AppointmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.log.version()
    }
}

impl Aggregate for Appointment {
    const AGGREGATE_TYPE: &'static str = "Appointment";
    type Event = AppointmentEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AppointmentEvent::AppointmentScheduled(e) => {
                self.patient_id = Some(e.patient_id);
                self.practitioner_id = e.practitioner_id;
                self.starts_at = Some(e.starts_at);
                self.duration_minutes = e.duration_minutes;
                self.status = AppointmentStatus::Scheduled;
                self.created = true;
            }
            AppointmentEvent::AppointmentConfirmed(_) => {
                self.status = AppointmentStatus::Confirmed;
            }
            AppointmentEvent::AppointmentRescheduled(e) => {
                self.starts_at = Some(e.starts_at);
                self.duration_minutes = e.duration_minutes;
                self.status = AppointmentStatus::Scheduled;
            }
            AppointmentEvent::AppointmentCancelled(e) => {
                self.status = AppointmentStatus::Cancelled;
                self.cancellation_reason = e.reason.clone();
            }
            AppointmentEvent::AppointmentCompleted(_) => {
                self.status = AppointmentStatus::Completed;
            }
            AppointmentEvent::AppointmentNoShow(_) => {
                self.status = AppointmentStatus::NoShow;
            }
        }
    }
}

impl EventSourced for Appointment {
    fn aggregate_id(&self) -> AggregateId {
        self.id.0
    }

    fn event_log(&self) -> &EventLog<AppointmentEvent> {
        &self.log
    }

    fn event_log_mut(&mut self) -> &mut EventLog<AppointmentEvent> {
        &mut self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use clinicflow_core::TenantId;
    use proptest::prelude::*;

    fn test_ctx() -> EventContext {
        EventContext::new(TenantId::new())
    }

    fn test_appointment_id() -> AppointmentId {
        AppointmentId::new(AggregateId::new())
    }

    fn test_patient_id() -> PatientId {
        PatientId::new(AggregateId::new())
    }

    fn test_schedule() -> ScheduleAppointment {
        ScheduleAppointment {
            patient_id: test_patient_id(),
            practitioner_id: Some(UserId::new()),
            starts_at: Utc::now() + Duration::days(2),
            duration_minutes: 30,
        }
    }

    fn scheduled(ctx: &EventContext) -> Appointment {
        Appointment::schedule(ctx, test_appointment_id(), test_schedule()).unwrap()
    }

    #[test]
    fn schedule_emits_appointment_scheduled_at_version_one() {
        let id = test_appointment_id();
        let cmd = test_schedule();
        let appt = Appointment::schedule(&test_ctx(), id, cmd.clone()).unwrap();

        assert_eq!(appt.version(), 1);
        assert_eq!(appt.status(), AppointmentStatus::Scheduled);
        assert_eq!(appt.uncommitted().len(), 1);
        match appt.uncommitted()[0].event_data() {
            AppointmentEvent::AppointmentScheduled(e) => {
                assert_eq!(e.appointment_id, id);
                assert_eq!(e.patient_id, cmd.patient_id);
                assert_eq!(e.duration_minutes, 30);
            }
            other => panic!("Expected AppointmentScheduled, got {other:?}"),
        }
    }

    #[test]
    fn schedule_rejects_invalid_duration() {
        let mut cmd = test_schedule();
        cmd.duration_minutes = 0;
        assert!(matches!(
            Appointment::schedule(&test_ctx(), test_appointment_id(), cmd),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn confirm_then_complete() {
        let ctx = test_ctx();
        let mut appt = scheduled(&ctx);
        appt.confirm(&ctx).unwrap();
        appt.complete(&ctx).unwrap();

        assert_eq!(appt.status(), AppointmentStatus::Completed);
        assert_eq!(appt.version(), 3);
        let types: Vec<&str> = appt.uncommitted().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["AppointmentScheduled", "AppointmentConfirmed", "AppointmentCompleted"]
        );
    }

    #[test]
    fn confirming_a_cancelled_appointment_fails_without_emitting() {
        let ctx = test_ctx();
        let mut appt = scheduled(&ctx);
        appt.cancel(&ctx, Some("patient travelling".to_string())).unwrap();
        let before = appt.uncommitted().len();

        let err = appt.confirm(&ctx).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(appt.uncommitted().len(), before);
        assert_eq!(appt.cancellation_reason(), Some("patient travelling"));
    }

    #[test]
    fn double_cancel_is_rejected() {
        let ctx = test_ctx();
        let mut appt = scheduled(&ctx);
        appt.cancel(&ctx, None).unwrap();
        assert!(appt.cancel(&ctx, None).is_err());
        assert_eq!(appt.version(), 2);
    }

    #[test]
    fn reschedule_resets_confirmation() {
        let ctx = test_ctx();
        let mut appt = scheduled(&ctx);
        appt.confirm(&ctx).unwrap();

        let new_start = Utc::now() + Duration::days(5);
        appt.reschedule(&ctx, new_start, 45).unwrap();

        assert_eq!(appt.status(), AppointmentStatus::Scheduled);
        assert_eq!(appt.starts_at(), Some(new_start));
        assert_eq!(appt.duration_minutes(), 45);
    }

    #[test]
    fn no_show_is_terminal() {
        let ctx = test_ctx();
        let mut appt = scheduled(&ctx);
        appt.mark_no_show(&ctx).unwrap();

        assert_eq!(appt.status(), AppointmentStatus::NoShow);
        assert!(appt.complete(&ctx).is_err());
        assert!(appt.mark_no_show(&ctx).is_err());
    }

    #[test]
    fn commands_on_empty_appointment_are_not_found() {
        let ctx = test_ctx();
        let mut appt = Appointment::empty(test_appointment_id());
        assert_eq!(appt.confirm(&ctx), Err(DomainError::NotFound));
        assert_eq!(appt.cancel(&ctx, None), Err(DomainError::NotFound));
    }

    #[test]
    fn every_event_carries_patient_id() {
        let ctx = test_ctx();
        let mut appt = scheduled(&ctx);
        appt.confirm(&ctx).unwrap();
        appt.cancel(&ctx, None).unwrap();
        let patient_id = appt.patient_id().unwrap().to_string();

        for env in appt.uncommitted() {
            let raw = env.to_domain_event().unwrap();
            assert_eq!(raw.data_str("patient_id"), Some(patient_id.as_str()));
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Confirm,
        Reschedule(u32),
        Cancel,
        Complete,
        NoShow,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Confirm),
            (1u32..240).prop_map(Step::Reschedule),
            Just(Step::Cancel),
            Just(Step::Complete),
            Just(Step::NoShow),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: version equals the number of accepted commands, and
        /// replaying the recorded history rebuilds identical state.
        #[test]
        fn replay_equals_incremental(steps in prop::collection::vec(step_strategy(), 0..12)) {
            let ctx = test_ctx();
            let mut live = scheduled(&ctx);
            let mut accepted = 1u64;

            for (i, step) in steps.into_iter().enumerate() {
                let result = match step {
                    Step::Confirm => live.confirm(&ctx),
                    Step::Reschedule(minutes) => {
                        live.reschedule(&ctx, Utc::now() + Duration::days(i as i64 + 3), minutes)
                    }
                    Step::Cancel => live.cancel(&ctx, None),
                    Step::Complete => live.complete(&ctx),
                    Step::NoShow => live.mark_no_show(&ctx),
                };
                if result.is_ok() {
                    accepted += 1;
                }
            }

            prop_assert_eq!(live.version(), accepted);

            let history = live.take_uncommitted();
            let versions: Vec<u64> = history.iter().map(|e| e.aggregate_version()).collect();
            prop_assert_eq!(versions, (1..=accepted).collect::<Vec<u64>>());

            let mut replayed = Appointment::empty(live.id_typed());
            replayed.load_from_history(history).unwrap();

            prop_assert_eq!(replayed.version(), live.version());
            prop_assert_eq!(replayed.status(), live.status());
            prop_assert_eq!(replayed.starts_at(), live.starts_at());
            prop_assert_eq!(replayed.duration_minutes(), live.duration_minutes());
        }
    }
}
