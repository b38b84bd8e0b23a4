//! Data stages a cleaning rule may be applied to.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// A stage of the curation pipeline
///
/// Each stage is a distinct dataset lineage; a rule declares the stages it
/// is meaningful for and is reported as not applicable elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStage {
    /// Participant-provided data
    Rdr,
    /// Electronic health record submissions
    Ehr,
    /// EHR submissions unioned across sites
    Unioned,
    /// RDR combined with unioned EHR
    Combined,
    /// Registered tier de-identified dataset
    RegisteredTierDeid,
    /// Registered tier base dataset
    RegisteredTierDeidBase,
    /// Registered tier clean dataset
    RegisteredTierDeidClean,
    /// Controlled tier de-identified dataset
    ControlledTierDeid,
    /// Controlled tier base dataset
    ControlledTierDeidBase,
    /// Controlled tier clean dataset
    ControlledTierDeidClean,
    /// Registered tier wearables dataset
    RegisteredTierFitbit,
    /// Controlled tier wearables dataset
    ControlledTierFitbit,
}

impl DataStage {
    /// All stages in pipeline order
    pub const ALL: [DataStage; 12] = [
        Self::Rdr,
        Self::Ehr,
        Self::Unioned,
        Self::Combined,
        Self::RegisteredTierDeid,
        Self::RegisteredTierDeidBase,
        Self::RegisteredTierDeidClean,
        Self::ControlledTierDeid,
        Self::ControlledTierDeidBase,
        Self::ControlledTierDeidClean,
        Self::RegisteredTierFitbit,
        Self::ControlledTierFitbit,
    ];

    /// Snake-case name used on the command line and in catalog files
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rdr => "rdr",
            Self::Ehr => "ehr",
            Self::Unioned => "unioned",
            Self::Combined => "combined",
            Self::RegisteredTierDeid => "registered_tier_deid",
            Self::RegisteredTierDeidBase => "registered_tier_deid_base",
            Self::RegisteredTierDeidClean => "registered_tier_deid_clean",
            Self::ControlledTierDeid => "controlled_tier_deid",
            Self::ControlledTierDeidBase => "controlled_tier_deid_base",
            Self::ControlledTierDeidClean => "controlled_tier_deid_clean",
            Self::RegisteredTierFitbit => "registered_tier_fitbit",
            Self::ControlledTierFitbit => "controlled_tier_fitbit",
        }
    }
}

impl std::str::FromStr for DataStage {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| CoreError::UnknownStage { name: s.to_string() })
    }
}

impl std::fmt::Display for DataStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_every_stage() {
        for stage in DataStage::ALL {
            let parsed: DataStage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let parsed: DataStage = "Controlled_Tier_Deid".parse().unwrap();
        assert_eq!(parsed, DataStage::ControlledTierDeid);
    }

    #[test]
    fn test_parse_unknown() {
        let err = "staging".parse::<DataStage>().unwrap_err();
        assert_eq!(err, CoreError::UnknownStage { name: "staging".to_string() });
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&DataStage::RegisteredTierFitbit).unwrap();
        assert_eq!(json, "\"registered_tier_fitbit\"");
    }
}
