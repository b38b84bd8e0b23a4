//! Sandbox validation for generated query lists.
//!
//! Every statement that destroys rows of a table must be preceded, in the
//! same rule, by a statement that copies the affected rows into that rule's
//! sandbox table for the table. The check is structural: it looks only at
//! the declared destination, write mode, and mutation target of each query.

use crate::descriptor::RuleDescriptor;
use crate::query::{QuerySpec, WriteMode};
use curation_core::{Coordinates, RuleId, TableRef};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Deterministic sandbox table name for `rule` and `table`
///
/// Re-running a rule overwrites the same table instead of adding a new one.
#[must_use]
pub fn sandbox_table_name(rule: &RuleId, table: &str) -> String {
    format!("{}_{}", rule.as_str(), table).to_ascii_lowercase()
}

/// An audit copy of the rows a rule is about to mutate or delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxTable {
    /// Table in the cleaned dataset the rows come from
    pub affected_table: String,
    /// Location of the audit copy
    pub location: TableRef,
}

/// Sandbox table names of one rule
///
/// Names default to [`sandbox_table_name`]; a rule may override the name
/// for individual tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxNames {
    rule: RuleId,
    overrides: IndexMap<String, String>,
}

impl SandboxNames {
    /// Derived names for every table
    #[must_use]
    pub fn derived(rule: RuleId) -> Self {
        Self {
            rule,
            overrides: IndexMap::new(),
        }
    }

    /// Use `name` as the sandbox table for `table`
    #[must_use]
    pub fn with_override(mut self, table: impl Into<String>, name: impl Into<String>) -> Self {
        self.overrides.insert(table.into(), name.into());
        self
    }

    /// Sandbox table name for `table`
    #[must_use]
    pub fn name_for(&self, table: &str) -> String {
        self.overrides
            .get(table)
            .cloned()
            .unwrap_or_else(|| sandbox_table_name(&self.rule, table))
    }

    /// Sandbox table for `table` under `coords`
    #[must_use]
    pub fn table(&self, coords: &Coordinates, table: &str) -> SandboxTable {
        SandboxTable {
            affected_table: table.to_string(),
            location: coords.sandbox_table(&self.name_for(table)),
        }
    }

    /// Sandbox tables for every affected table of `descriptor`
    #[must_use]
    pub fn tables(&self, coords: &Coordinates, descriptor: &RuleDescriptor) -> Vec<SandboxTable> {
        descriptor
            .affected_tables
            .iter()
            .map(|t| self.table(coords, t))
            .collect()
    }
}

/// A violation of the sandbox requirement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxViolation {
    /// Destructive statement with no earlier sandbox copy
    #[error("query {index} destroys rows of {table} but no earlier query writes sandbox table {expected}")]
    MissingSandbox {
        /// Position of the destructive query
        index: usize,
        /// Table whose rows are destroyed
        table: String,
        /// Sandbox table that should have been written first
        expected: String,
    },

    /// Destructive statement on a table the rule did not declare
    #[error("query {index} destroys rows of {table}, which is not an affected table of {rule}")]
    UndeclaredTable {
        /// Position of the destructive query
        index: usize,
        /// Table whose rows are destroyed
        table: String,
        /// Rule that generated the query
        rule: RuleId,
    },
}

/// Result of a passing check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCoverage {
    /// Sandbox writes that precede a destructive statement, by position
    pub covering_writes: Vec<usize>,
    /// Sandbox writes in APPEND mode, by position
    pub appending_writes: Vec<usize>,
}

/// Checks query lists against the sandbox requirement
pub struct SandboxValidator<'a> {
    /// Coordinates the queries were generated for
    coords: &'a Coordinates,
}

impl<'a> SandboxValidator<'a> {
    /// Create a validator for one run's coordinates
    #[must_use]
    pub fn new(coords: &'a Coordinates) -> Self {
        Self { coords }
    }

    /// Validate one rule's ordered query list
    ///
    /// # Errors
    ///
    /// Returns every violation found
    pub fn validate(
        &self,
        descriptor: &RuleDescriptor,
        names: &SandboxNames,
        queries: &[QuerySpec],
    ) -> Result<SandboxCoverage, Vec<SandboxViolation>> {
        let mut errors = Vec::new();
        let mut coverage = SandboxCoverage::default();
        // sandbox table name -> position of its first write
        let mut written: IndexMap<&str, usize> = IndexMap::new();

        for (index, query) in queries.iter().enumerate() {
            if let Some(table) = query.destroys(self.coords) {
                if !descriptor.is_dataset_wide() && !descriptor.affected_tables.contains(table) {
                    errors.push(SandboxViolation::UndeclaredTable {
                        index,
                        table: table.to_string(),
                        rule: descriptor.id.clone(),
                    });
                }
                let expected = names.name_for(table);
                match written.get(expected.as_str()) {
                    Some(&at) => {
                        if !coverage.covering_writes.contains(&at) {
                            coverage.covering_writes.push(at);
                        }
                    }
                    None => errors.push(SandboxViolation::MissingSandbox {
                        index,
                        table: table.to_string(),
                        expected,
                    }),
                }
            }

            if let Some(sandbox) = query.sandbox_destination(self.coords) {
                written.entry(sandbox).or_insert(index);
                if query.write_mode == WriteMode::Append {
                    coverage.appending_writes.push(index);
                }
            }
        }

        if errors.is_empty() {
            coverage.covering_writes.sort_unstable();
            Ok(coverage)
        } else {
            Err(errors)
        }
    }
}

/// Make every covering sandbox write blocking
///
/// Returns the positions that were changed.
pub fn promote_covering_writes(queries: &mut [QuerySpec], coverage: &SandboxCoverage) -> Vec<usize> {
    let mut promoted = Vec::new();
    for &index in &coverage.covering_writes {
        if let Some(query) = queries.get_mut(index) {
            if !query.is_blocking {
                query.is_blocking = true;
                promoted.push(index);
            }
        }
    }
    promoted
}
