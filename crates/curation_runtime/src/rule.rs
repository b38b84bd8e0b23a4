//! The cleaning-rule capability.
//!
//! The engine holds rules as `dyn CleaningRule` values and only ever calls
//! the operations below; it never inspects concrete rule types.

use crate::executor::{JobExecutor, JobResult};
use crate::warehouse::WarehouseClient;
use async_trait::async_trait;
use curation_core::{Coordinates, RuleId, RunId};
use curation_plan::{QuerySpec, RuleDescriptor, SandboxNames, SandboxTable};
use indexmap::IndexMap;

/// Error raised by a rule operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    /// The rule could not do what was asked
    #[error("{0}")]
    Message(String),

    /// A statement the rule ran itself failed
    #[error("statement {index} failed: {cause}")]
    Statement {
        /// Position among the statements the rule submitted
        index: usize,
        /// Failure description
        cause: String,
    },

    /// The run was cancelled while the rule was running statements
    #[error("cancelled")]
    Cancelled,
}

impl RuleError {
    /// Error with a free-form message
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Result of a rule's post-condition check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The post-condition holds
    Passed,
    /// The rule has no post-condition; treated as passing
    NotImplemented,
    /// The post-condition does not hold
    Failed {
        /// Why the check failed
        reason: String,
    },
}

/// What a rule operation can see of the run
pub struct RuleContext<'a> {
    /// Current run
    pub run_id: RunId,
    /// Rule being driven
    pub rule: &'a RuleId,
    /// Project, dataset, and sandbox dataset of the run
    pub coordinates: &'a Coordinates,
    executor: &'a JobExecutor,
}

impl<'a> RuleContext<'a> {
    /// Create a context
    #[must_use]
    pub fn new(
        run_id: RunId,
        rule: &'a RuleId,
        coordinates: &'a Coordinates,
        executor: &'a JobExecutor,
    ) -> Self {
        Self {
            run_id,
            rule,
            coordinates,
            executor,
        }
    }

    /// Warehouse client of the run
    #[must_use]
    pub fn warehouse(&self) -> &dyn WarehouseClient {
        self.executor.warehouse()
    }

    /// Labels attached to every job this rule submits
    #[must_use]
    pub fn labels(&self) -> IndexMap<String, String> {
        let mut labels = IndexMap::new();
        labels.insert("run".to_string(), self.run_id.to_string());
        labels.insert("rule".to_string(), self.rule.as_str().to_ascii_lowercase());
        labels
    }

    /// Run statements with the run's retry policy and cancellation
    pub async fn run_statements(&self, queries: &[QuerySpec]) -> Vec<JobResult> {
        self.executor.run_labeled(queries, &self.labels()).await
    }

    /// Run statements and fail on the first one that did not succeed
    ///
    /// # Errors
    ///
    /// Returns error if a statement failed or the run was cancelled
    pub async fn run_checked(&self, queries: &[QuerySpec]) -> Result<(), RuleError> {
        for result in self.run_statements(queries).await {
            if let Some(cause) = result.failure() {
                return Err(RuleError::Statement {
                    index: result.index,
                    cause: cause.to_string(),
                });
            }
            if result.cancelled() {
                return Err(RuleError::Cancelled);
            }
        }
        Ok(())
    }
}

/// A cleaning rule
#[async_trait]
pub trait CleaningRule: Send + Sync {
    /// Static metadata
    fn descriptor(&self) -> &RuleDescriptor;

    /// Prepare preconditions such as lookup tables
    ///
    /// # Errors
    ///
    /// A setup error fails the rule before any query is generated
    async fn setup(&self, ctx: &RuleContext<'_>) -> Result<(), RuleError> {
        let _ = ctx;
        Ok(())
    }

    /// Produce the ordered statement list
    ///
    /// Must not perform I/O; it may be called more than once.
    ///
    /// # Errors
    ///
    /// Returns error if the statements cannot be built
    fn query_specs(&self, coords: &Coordinates) -> Result<Vec<QuerySpec>, RuleError>;

    /// Check the rule's post-condition after its statements succeeded
    ///
    /// # Errors
    ///
    /// Returns error if the check itself could not run
    async fn validate(&self, ctx: &RuleContext<'_>) -> Result<Validation, RuleError> {
        let _ = ctx;
        Ok(Validation::NotImplemented)
    }

    /// Names of this rule's sandbox tables
    fn sandbox_names(&self) -> SandboxNames {
        SandboxNames::derived(self.descriptor().id.clone())
    }

    /// Sandbox tables this rule writes under `coords`
    fn sandbox_tables(&self, coords: &Coordinates) -> Vec<SandboxTable> {
        self.sandbox_names().tables(coords, self.descriptor())
    }
}
