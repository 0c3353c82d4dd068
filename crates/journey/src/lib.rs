//! Patient journey domain module (event-sourced).
//!
//! A journey follows one patient through the clinic funnel:
//!
//! ```text
//! lead → engaged → scheduled → confirmed → in_treatment → completed
//!                      ↘ at_risk / dropped (from most stages)
//! ```
//!
//! Stage changes are validated against a fixed adjacency table
//! ([`JourneyStage::can_transition_to`]). Risk factors are scored with a
//! weighted average ([`calculate_risk_score`]) and a high enough score pulls
//! the journey into `at_risk`.

pub mod journey;
pub mod risk;
pub mod stage;

pub use journey::{
    JourneyEvent, JourneyId, JourneyMilestoneReached, JourneyStageChanged, JourneyStarted, Milestone, PatientJourney,
    RiskDetected, StageChange,
};
pub use risk::{RiskFactor, RiskLevel, calculate_risk_score, get_risk_level};
pub use stage::JourneyStage;
