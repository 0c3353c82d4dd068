use core::str::FromStr;

use serde::{Deserialize, Serialize};

use clinicflow_core::DomainError;

/// Position of a patient in the clinic funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStage {
    Lead,
    Engaged,
    Scheduled,
    Confirmed,
    InTreatment,
    Completed,
    Dropped,
    AtRisk,
}

impl JourneyStage {
    pub const ALL: [JourneyStage; 8] = [
        JourneyStage::Lead,
        JourneyStage::Engaged,
        JourneyStage::Scheduled,
        JourneyStage::Confirmed,
        JourneyStage::InTreatment,
        JourneyStage::Completed,
        JourneyStage::Dropped,
        JourneyStage::AtRisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStage::Lead => "lead",
            JourneyStage::Engaged => "engaged",
            JourneyStage::Scheduled => "scheduled",
            JourneyStage::Confirmed => "confirmed",
            JourneyStage::InTreatment => "in_treatment",
            JourneyStage::Completed => "completed",
            JourneyStage::Dropped => "dropped",
            JourneyStage::AtRisk => "at_risk",
        }
    }

    /// Stages reachable in one step.
    pub fn allowed_targets(&self) -> &'static [JourneyStage] {
        use JourneyStage::*;
        match self {
            Lead => &[Engaged, Scheduled, AtRisk, Dropped],
            Engaged => &[Scheduled, AtRisk, Dropped],
            Scheduled => &[Confirmed, Engaged, InTreatment, AtRisk, Dropped],
            Confirmed => &[InTreatment, Engaged, AtRisk, Dropped],
            InTreatment => &[Scheduled, Completed, AtRisk, Dropped],
            AtRisk => &[Engaged, Scheduled, Dropped],
            Dropped => &[Engaged],
            Completed => &[],
        }
    }

    pub fn can_transition_to(&self, target: JourneyStage) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }
}

impl core::fmt::Display for JourneyStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JourneyStage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JourneyStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown journey stage: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_is_the_only_terminal_stage() {
        let terminal: Vec<_> = JourneyStage::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![JourneyStage::Completed]);
    }

    #[test]
    fn lead_cannot_jump_to_completed() {
        assert!(JourneyStage::Lead.can_transition_to(JourneyStage::Engaged));
        assert!(!JourneyStage::Lead.can_transition_to(JourneyStage::Completed));
    }

    #[test]
    fn no_stage_transitions_to_itself() {
        for stage in JourneyStage::ALL {
            assert!(!stage.can_transition_to(stage), "{stage} loops onto itself");
        }
    }

    #[test]
    fn every_non_terminal_stage_can_drop_or_recover() {
        for stage in JourneyStage::ALL {
            if stage.is_terminal() || stage == JourneyStage::Dropped {
                continue;
            }
            assert!(stage.can_transition_to(JourneyStage::Dropped), "{stage} cannot drop");
        }
        assert!(JourneyStage::Dropped.can_transition_to(JourneyStage::Engaged));
    }

    #[test]
    fn parses_wire_names() {
        for stage in JourneyStage::ALL {
            assert_eq!(stage.as_str().parse::<JourneyStage>().unwrap(), stage);
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.as_str());
        }
        assert!("archived".parse::<JourneyStage>().is_err());
    }
}
