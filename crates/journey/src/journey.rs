use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clinicflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult};
use clinicflow_events::{Event, EventContext, EventLog, EventSourced};
use clinicflow_patients::PatientId;

use crate::risk::{RiskFactor, RiskLevel, calculate_risk_score, get_risk_level};
use crate::stage::JourneyStage;

/// Namespace for journey ids derived from patient ids.
const FIRST_JOURNEY_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_4d0e_9a57_4b8e_a3f2_7d51_c0e8_1b94);

/// Patient journey identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JourneyId(pub AggregateId);

impl JourneyId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// Deterministic id for a patient's first journey.
    ///
    /// Starting the same first journey twice lands on the same stream, so the
    /// second start loses the version-1 race instead of creating a duplicate.
    pub fn first_for(patient_id: PatientId) -> Self {
        let uuid = Uuid::new_v5(&FIRST_JOURNEY_NAMESPACE, patient_id.0.as_uuid().as_bytes());
        Self(AggregateId::from_uuid(uuid))
    }
}

impl core::fmt::Display for JourneyId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Set-once markers along a journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    FirstMessage,
    FirstAppointment,
    FirstConsultationCompleted,
}

impl Milestone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::FirstMessage => "first_message",
            Milestone::FirstAppointment => "first_appointment",
            Milestone::FirstConsultationCompleted => "first_consultation_completed",
        }
    }
}

/// One entry of the stage history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChange {
    pub from: JourneyStage,
    pub to: JourneyStage,
    pub reason: Option<String>,
}

/// Event: JourneyStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyStarted {
    pub journey_id: JourneyId,
    pub patient_id: PatientId,
    pub stage: JourneyStage,
}

/// Event: JourneyStageChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyStageChanged {
    pub journey_id: JourneyId,
    pub patient_id: PatientId,
    pub from: JourneyStage,
    pub to: JourneyStage,
    pub reason: Option<String>,
}

/// Event: JourneyMilestoneReached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyMilestoneReached {
    pub journey_id: JourneyId,
    pub patient_id: PatientId,
    pub milestone: Milestone,
}

/// Event: RiskDetected.
///
/// Carries the full set of active factors after merging `factor`, so replay
/// does not need to recompute anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDetected {
    pub journey_id: JourneyId,
    pub patient_id: PatientId,
    pub factor: RiskFactor,
    pub active_factors: Vec<RiskFactor>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "event_data")]
pub enum JourneyEvent {
    JourneyStarted(JourneyStarted),
    JourneyStageChanged(JourneyStageChanged),
    JourneyMilestoneReached(JourneyMilestoneReached),
    RiskDetected(RiskDetected),
}

impl Event for JourneyEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "JourneyStarted",
        "JourneyStageChanged",
        "JourneyMilestoneReached",
        "RiskDetected",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            JourneyEvent::JourneyStarted(_) => "JourneyStarted",
            JourneyEvent::JourneyStageChanged(_) => "JourneyStageChanged",
            JourneyEvent::JourneyMilestoneReached(_) => "JourneyMilestoneReached",
            JourneyEvent::RiskDetected(_) => "RiskDetected",
        }
    }
}

/// Aggregate root: PatientJourney.
#[derive(Debug, Clone)]
pub struct PatientJourney {
    id: JourneyId,
    patient_id: Option<PatientId>,
    stage: JourneyStage,
    history: Vec<StageChange>,
    milestones: Vec<Milestone>,
    risk_factors: Vec<RiskFactor>,
    risk_score: u8,
    risk_level: RiskLevel,
    log: EventLog<JourneyEvent>,
}

impl PatientJourney {
    /// Create an empty, not-yet-started aggregate instance for rehydration.
    pub fn empty(id: JourneyId) -> Self {
        Self {
            id,
            patient_id: None,
            stage: JourneyStage::Lead,
            history: Vec::new(),
            milestones: Vec::new(),
            risk_factors: Vec::new(),
            risk_score: 0,
            risk_level: RiskLevel::Low,
            log: EventLog::new(),
        }
    }

    /// Open a journey at `lead`.
    pub fn start(ctx: &EventContext, id: JourneyId, patient_id: PatientId) -> Self {
        let mut journey = Self::empty(id);
        journey.record(
            ctx,
            JourneyEvent::JourneyStarted(JourneyStarted {
                journey_id: id,
                patient_id,
                stage: JourneyStage::Lead,
            }),
        );
        journey
    }

    /// Move to `target` if the stage graph allows it.
    ///
    /// `at_risk` is only entered through [`PatientJourney::detect_risk`].
    pub fn transition_to(&mut self, ctx: &EventContext, target: JourneyStage, reason: Option<&str>) -> DomainResult<()> {
        let patient_id = self.ensure_started()?;
        if target == JourneyStage::AtRisk {
            return Err(DomainError::invariant("at_risk is entered through risk detection"));
        }
        self.ensure_transition(target)?;
        self.change_stage(ctx, patient_id, target, reason.map(str::to_string));
        Ok(())
    }

    /// Record `milestone` once. Returns `false` when it was already reached.
    pub fn reach_milestone(&mut self, ctx: &EventContext, milestone: Milestone) -> DomainResult<bool> {
        let patient_id = self.ensure_started()?;
        if self.has_milestone(milestone) {
            return Ok(false);
        }

        self.record(
            ctx,
            JourneyEvent::JourneyMilestoneReached(JourneyMilestoneReached {
                journey_id: self.id,
                patient_id,
                milestone,
            }),
        );
        Ok(true)
    }

    /// Add (or refresh) a risk factor and rescore.
    ///
    /// A high or critical result moves the journey into `at_risk` with a
    /// second event, unless it is already there or completed.
    pub fn detect_risk(&mut self, ctx: &EventContext, factor: RiskFactor) -> DomainResult<RiskLevel> {
        let patient_id = self.ensure_started()?;

        let mut active_factors: Vec<RiskFactor> = self
            .risk_factors
            .iter()
            .filter(|f| f.name() != factor.name())
            .cloned()
            .collect();
        active_factors.push(factor.clone());

        let risk_score = calculate_risk_score(&active_factors);
        let risk_level = get_risk_level(risk_score);

        self.record(
            ctx,
            JourneyEvent::RiskDetected(RiskDetected {
                journey_id: self.id,
                patient_id,
                factor,
                active_factors,
                risk_score,
                risk_level,
            }),
        );

        let already_settled = matches!(self.stage, JourneyStage::AtRisk | JourneyStage::Completed);
        if risk_level.requires_intervention()
            && !already_settled
            && self.stage.can_transition_to(JourneyStage::AtRisk)
        {
            let reason = format!("risk level {}", risk_level.as_str());
            self.change_stage(ctx, patient_id, JourneyStage::AtRisk, Some(reason));
        }

        Ok(risk_level)
    }

    pub fn id_typed(&self) -> JourneyId {
        self.id
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn stage(&self) -> JourneyStage {
        self.stage
    }

    pub fn is_open(&self) -> bool {
        self.patient_id.is_some() && self.stage != JourneyStage::Completed
    }

    pub fn stage_history(&self) -> &[StageChange] {
        &self.history
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn has_milestone(&self, milestone: Milestone) -> bool {
        self.milestones.contains(&milestone)
    }

    pub fn risk_factors(&self) -> &[RiskFactor] {
        &self.risk_factors
    }

    pub fn risk_score(&self) -> u8 {
        self.risk_score
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    fn ensure_started(&self) -> DomainResult<PatientId> {
        self.patient_id.ok_or_else(DomainError::not_found)
    }

    fn ensure_transition(&self, target: JourneyStage) -> DomainResult<()> {
        if !self.stage.can_transition_to(target) {
            return Err(DomainError::invariant(format!(
                "illegal journey transition {} -> {}",
                self.stage, target
            )));
        }
        Ok(())
    }

    fn change_stage(&mut self, ctx: &EventContext, patient_id: PatientId, to: JourneyStage, reason: Option<String>) {
        self.record(
            ctx,
            JourneyEvent::JourneyStageChanged(JourneyStageChanged {
                journey_id: self.id,
                patient_id,
                from: self.stage,
                to,
                reason,
            }),
        );
    }
}

impl AggregateRoot for PatientJourney {
    type Id = JourneyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.log.version()
    }
}

impl Aggregate for PatientJourney {
    const AGGREGATE_TYPE: &'static str = "PatientJourney";
    type Event = JourneyEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            JourneyEvent::JourneyStarted(e) => {
                self.patient_id = Some(e.patient_id);
                self.stage = e.stage;
            }
            JourneyEvent::JourneyStageChanged(e) => {
                self.history.push(StageChange {
                    from: e.from,
                    to: e.to,
                    reason: e.reason.clone(),
                });
                self.stage = e.to;
            }
            JourneyEvent::JourneyMilestoneReached(e) => {
                if !self.milestones.contains(&e.milestone) {
                    self.milestones.push(e.milestone);
                }
            }
            JourneyEvent::RiskDetected(e) => {
                self.risk_factors = e.active_factors.clone();
                self.risk_score = e.risk_score;
                self.risk_level = e.risk_level;
            }
        }
    }
}

impl EventSourced for PatientJourney {
    fn aggregate_id(&self) -> AggregateId {
        self.id.0
    }

    fn event_log(&self) -> &EventLog<JourneyEvent> {
        &self.log
    }

    fn event_log_mut(&mut self) -> &mut EventLog<JourneyEvent> {
        &mut self.log
    }
}
