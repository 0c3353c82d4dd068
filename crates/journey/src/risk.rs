//! Risk factors and scoring.

use serde::{Deserialize, Serialize};

use clinicflow_core::{DomainError, DomainResult, ValueObject};

pub const NO_SHOW: &str = "NO_SHOW";
pub const FREQUENT_CANCELLATIONS: &str = "FREQUENT_CANCELLATIONS";

/// One weighted signal that a patient may drop out.
///
/// `weight` is in `[0, 1]`, `score` in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRiskFactor")]
pub struct RiskFactor {
    name: String,
    weight: f64,
    score: f64,
}

#[derive(Deserialize)]
struct RawRiskFactor {
    name: String,
    weight: f64,
    score: f64,
}

impl TryFrom<RawRiskFactor> for RiskFactor {
    type Error = DomainError;

    fn try_from(raw: RawRiskFactor) -> Result<Self, Self::Error> {
        RiskFactor::new(raw.name, raw.weight, raw.score)
    }
}

impl RiskFactor {
    pub fn new(name: impl Into<String>, weight: f64, score: f64) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("risk factor name cannot be empty"));
        }
        if !(0.0..=1.0).contains(&weight) {
            return Err(DomainError::validation(format!("risk weight {weight} outside [0, 1]")));
        }
        if !(0.0..=100.0).contains(&score) {
            return Err(DomainError::validation(format!("risk score {score} outside [0, 100]")));
        }
        Ok(Self { name, weight, score })
    }

    /// Patient did not attend a booked appointment.
    pub fn no_show() -> Self {
        Self {
            name: NO_SHOW.to_string(),
            weight: 1.0,
            score: 100.0,
        }
    }

    /// Patient keeps cancelling appointments.
    pub fn frequent_cancellations() -> Self {
        Self {
            name: FREQUENT_CANCELLATIONS.to_string(),
            weight: 0.8,
            score: 75.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn score(&self) -> f64 {
        self.score
    }
}

impl ValueObject for RiskFactor {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// High and critical risk pull a journey into `at_risk`.
    pub fn requires_intervention(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

/// Weighted average of factor scores, rounded to the nearest integer.
///
/// No factors (or only zero-weight factors) score 0.
pub fn calculate_risk_score(factors: &[RiskFactor]) -> u8 {
    let total_weight: f64 = factors.iter().map(|f| f.weight).sum();
    if total_weight <= 0.0 {
        return 0;
    }
    let weighted: f64 = factors.iter().map(|f| f.score * f.weight).sum();
    (weighted / total_weight).round().clamp(0.0, 100.0) as u8
}

pub fn get_risk_level(score: u8) -> RiskLevel {
    match score {
        0..=24 => RiskLevel::Low,
        25..=49 => RiskLevel::Medium,
        50..=74 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}
