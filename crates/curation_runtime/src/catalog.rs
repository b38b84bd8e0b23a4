//! Immutable rule catalog.
//!
//! Built once at startup and passed by reference to the engine. Registration
//! order is kept; it is the tie-break order of the dependency resolver.

use crate::rule::CleaningRule;
use curation_core::RuleId;
use curation_plan::{DependencyResolver, ResolveError, RuleDescriptor};
use indexmap::IndexMap;
use std::sync::Arc;

/// Error building or loading a catalog
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Two rules share an id
    #[error("rule {rule} is registered twice")]
    DuplicateRule {
        /// Repeated id
        rule: RuleId,
    },

    /// A rule depends on a rule that is not in the catalog
    #[error("rule {rule} depends on {dependency}, which is not in the catalog")]
    UnknownDependency {
        /// Dependent rule
        rule: RuleId,
        /// Missing dependency
        dependency: RuleId,
    },

    /// Two affected tables map to the same sandbox table
    #[error("sandbox table {name} is claimed by {first} and {second}")]
    SandboxCollision {
        /// Shared sandbox table name
        name: String,
        /// Rule that claimed the name first
        first: RuleId,
        /// Rule whose table collides with it
        second: RuleId,
    },

    /// A catalog file entry is malformed
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule {
        /// Rule id as written in the file
        rule: String,
        /// What is wrong
        reason: String,
    },

    /// The catalog file could not be read
    #[error("failed to read catalog {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },

    /// The catalog file is not valid TOML for the expected shape
    #[error("failed to parse catalog {path}: {message}")]
    Parse {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },
}

/// Builder for [`RuleCatalog`]
#[derive(Default)]
pub struct RuleCatalogBuilder {
    rules: IndexMap<RuleId, Arc<dyn CleaningRule>>,
}

impl RuleCatalogBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    ///
    /// # Errors
    ///
    /// Returns error if a rule with the same id is already registered
    pub fn register(self, rule: impl CleaningRule + 'static) -> Result<Self, CatalogError> {
        self.register_arc(Arc::new(rule))
    }

    /// Add a shared rule
    ///
    /// # Errors
    ///
    /// Returns error if a rule with the same id is already registered
    pub fn register_arc(mut self, rule: Arc<dyn CleaningRule>) -> Result<Self, CatalogError> {
        let id = rule.descriptor().id.clone();
        if self.rules.contains_key(&id) {
            return Err(CatalogError::DuplicateRule { rule: id });
        }
        self.rules.insert(id, rule);
        Ok(self)
    }

    /// Freeze the catalog
    ///
    /// # Errors
    ///
    /// Returns error if a rule depends on a rule that was not registered, or
    /// if two affected tables share a sandbox table name
    pub fn build(self) -> Result<RuleCatalog, CatalogError> {
        let mut sandbox_owners: IndexMap<String, RuleId> = IndexMap::new();
        for rule in self.rules.values() {
            let descriptor = rule.descriptor();
            if let Some(missing) = descriptor
                .depends_on
                .iter()
                .find(|dep| !self.rules.contains_key(*dep))
            {
                return Err(CatalogError::UnknownDependency {
                    rule: descriptor.id.clone(),
                    dependency: missing.clone(),
                });
            }

            let names = rule.sandbox_names();
            for table in &descriptor.affected_tables {
                let name = names.name_for(table);
                if let Some(first) = sandbox_owners.get(&name) {
                    return Err(CatalogError::SandboxCollision {
                        name,
                        first: first.clone(),
                        second: descriptor.id.clone(),
                    });
                }
                sandbox_owners.insert(name, descriptor.id.clone());
            }
        }
        Ok(RuleCatalog { rules: self.rules })
    }
}

/// Every rule known to a run, in registration order
#[derive(Clone)]
pub struct RuleCatalog {
    rules: IndexMap<RuleId, Arc<dyn CleaningRule>>,
}

impl RuleCatalog {
    /// Start building a catalog
    #[must_use]
    pub fn builder() -> RuleCatalogBuilder {
        RuleCatalogBuilder::new()
    }

    /// Look up a rule
    #[must_use]
    pub fn get(&self, id: &RuleId) -> Option<&Arc<dyn CleaningRule>> {
        self.rules.get(id)
    }

    /// Rule ids in registration order
    pub fn ids(&self) -> impl Iterator<Item = &RuleId> {
        self.rules.keys()
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &RuleDescriptor> {
        self.rules.values().map(|r| r.descriptor())
    }

    /// Resolver over the whole catalog
    ///
    /// # Errors
    ///
    /// Returns error if the catalog violates a resolver invariant
    pub fn resolver(&self) -> Result<DependencyResolver, ResolveError> {
        DependencyResolver::new(self.descriptors().cloned())
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the catalog has no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for RuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCatalog")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}
