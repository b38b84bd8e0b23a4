//! Identifiers for runs, rules, and warehouse jobs.
//!
//! Run ids are random UUIDs. Rule ids are names chosen by rule authors and
//! are validated because they flow into sandbox table names.

use crate::error::{CoreError, CoreResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characters allowed in a rule id: they must be usable in a table name.
static RULE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("static pattern"));

/// Longest rule id accepted. Sandbox table names append the affected table.
pub const MAX_RULE_ID_LEN: usize = 128;

/// Run identifier - identifies a single pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

/// Rule identifier - the catalog identity of one cleaning rule
///
/// Stable across runs; sandbox table names are derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleId(String);

impl RuleId {
    /// Create a rule id, validating its characters
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty, too long, or not table-name safe
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        if name.len() > MAX_RULE_ID_LEN {
            return Err(CoreError::InvalidId {
                kind: "rule id".to_string(),
                reason: format!("'{}' is longer than {} characters", name, MAX_RULE_ID_LEN),
            });
        }
        if !RULE_ID_PATTERN.is_match(&name) {
            return Err(CoreError::InvalidId {
                kind: "rule id".to_string(),
                reason: format!(
                    "'{}' must start with a letter and contain only letters, digits, and '_'",
                    name
                ),
            });
        }
        Ok(Self(name))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RuleId {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RuleId {
    type Error = CoreError;

    fn try_from(value: &str) -> CoreResult<Self> {
        Self::new(value)
    }
}

impl From<RuleId> for String {
    fn from(id: RuleId) -> Self {
        id.0
    }
}

impl std::str::FromStr for RuleId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::new(s)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Warehouse job identifier - assigned by the warehouse on submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Wrap a warehouse-assigned job id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_run_id_unique() {
        let id1 = RunId::new();
        let id2 = RunId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_run_id_display() {
        let id = RunId::from_bytes([0u8; 16]);
        assert_eq!(id.to_string(), "run_00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_rule_id_valid() {
        let id = RuleId::new("drop_zero_concept_ids").unwrap();
        assert_eq!(id.as_str(), "drop_zero_concept_ids");
        assert_eq!(id.to_string(), "drop_zero_concept_ids");
    }

    #[test]
    fn test_rule_id_rejects_bad_names() {
        assert!(RuleId::new("").is_err());
        assert!(RuleId::new("1starts_with_digit").is_err());
        assert!(RuleId::new("has-dash").is_err());
        assert!(RuleId::new("has.dot").is_err());
        assert!(RuleId::new("a".repeat(MAX_RULE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_rule_id_serde() {
        let id = RuleId::new("null_invalid_foreign_keys").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"null_invalid_foreign_keys\"");

        let bad: Result<RuleId, _> = serde_json::from_str("\"bad name\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_job_id() {
        let id = JobId::new("job_abc");
        assert_eq!(id.as_str(), "job_abc");
    }

    proptest! {
        #[test]
        fn prop_valid_names_accepted(name in "[a-z][a-z0-9_]{0,40}") {
            prop_assert!(RuleId::new(name).is_ok());
        }
    }
}
