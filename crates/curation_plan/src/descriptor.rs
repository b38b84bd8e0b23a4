//! Static metadata describing one cleaning rule.

use curation_core::{DataStage, RuleId};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Static description of a cleaning rule
///
/// Built once per pipeline invocation from a catalog entry and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDescriptor {
    /// Catalog identity
    pub id: RuleId,
    /// Issue/ticket tags, in the order the author listed them
    pub identifiers: IndexSet<String>,
    /// Human description
    pub description: String,
    /// Stages the rule applies to (empty = every stage)
    pub stages: IndexSet<DataStage>,
    /// Tables the rule may touch (empty = the whole dataset)
    pub affected_tables: IndexSet<String>,
    /// Rules whose effects must be in place first
    pub depends_on: IndexSet<RuleId>,
}

impl RuleDescriptor {
    /// Create a descriptor with no tags, stages, tables, or dependencies
    #[must_use]
    pub fn new(id: RuleId, description: impl Into<String>) -> Self {
        Self {
            id,
            identifiers: IndexSet::new(),
            description: description.into(),
            stages: IndexSet::new(),
            affected_tables: IndexSet::new(),
            depends_on: IndexSet::new(),
        }
    }

    /// Add an issue/ticket tag
    #[must_use]
    pub fn with_identifier(mut self, tag: impl Into<String>) -> Self {
        self.identifiers.insert(tag.into());
        self
    }

    /// Add a stage the rule applies to
    #[must_use]
    pub fn with_stage(mut self, stage: DataStage) -> Self {
        self.stages.insert(stage);
        self
    }

    /// Add an affected table
    #[must_use]
    pub fn with_affected_table(mut self, table: impl Into<String>) -> Self {
        self.affected_tables.insert(table.into());
        self
    }

    /// Add a dependency
    #[must_use]
    pub fn with_dependency(mut self, rule: RuleId) -> Self {
        self.depends_on.insert(rule);
        self
    }

    /// Whether the rule applies to `stage`
    ///
    /// An unknown stage (`None`) is treated as applicable.
    #[must_use]
    pub fn applies_to(&self, stage: Option<DataStage>) -> bool {
        match stage {
            Some(stage) => self.stages.is_empty() || self.stages.contains(&stage),
            None => true,
        }
    }

    /// Whether the rule operates on the whole dataset
    #[must_use]
    pub fn is_dataset_wide(&self) -> bool {
        self.affected_tables.is_empty()
    }

    /// Whether two rules may touch a common table
    ///
    /// Dataset-wide rules overlap with everything.
    #[must_use]
    pub fn overlaps(&self, other: &RuleDescriptor) -> bool {
        if self.is_dataset_wide() || other.is_dataset_wide() {
            return true;
        }
        self.affected_tables
            .iter()
            .any(|t| other.affected_tables.contains(t))
    }

    /// Label used in logs and reports: the id followed by its tags
    #[must_use]
    pub fn label(&self) -> String {
        if self.identifiers.is_empty() {
            self.id.to_string()
        } else {
            let tags: Vec<&str> = self.identifiers.iter().map(String::as_str).collect();
            format!("{} [{}]", self.id, tags.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str) -> RuleDescriptor {
        RuleDescriptor::new(RuleId::new(name).unwrap(), "test rule")
    }

    #[test]
    fn test_descriptor_builder() {
        let dep = RuleId::new("upstream").unwrap();
        let desc = rule("clean_dates")
            .with_identifier("DC-1000")
            .with_identifier("DC-1001")
            .with_stage(DataStage::Combined)
            .with_affected_table("observation")
            .with_dependency(dep.clone());

        assert_eq!(desc.identifiers.len(), 2);
        assert!(desc.depends_on.contains(&dep));
        assert!(!desc.is_dataset_wide());
        assert_eq!(desc.label(), "clean_dates [DC-1000, DC-1001]");
    }

    #[test]
    fn test_applies_to() {
        let any = rule("any");
        assert!(any.applies_to(Some(DataStage::Rdr)));
        assert!(any.applies_to(None));

        let ct = rule("ct").with_stage(DataStage::ControlledTierDeid);
        assert!(ct.applies_to(Some(DataStage::ControlledTierDeid)));
        assert!(!ct.applies_to(Some(DataStage::RegisteredTierDeid)));
        assert!(ct.applies_to(None));
    }

    #[test]
    fn test_overlaps() {
        let a = rule("a").with_affected_table("person");
        let b = rule("b").with_affected_table("observation");
        let c = rule("c").with_affected_table("observation").with_affected_table("measurement");
        let wide = rule("wide");

        assert!(!a.overlaps(&b));
        assert!(b.overlaps(&c));
        assert!(wide.overlaps(&a));
        assert!(a.overlaps(&wide));
    }
}
