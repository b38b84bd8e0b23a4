//! Per-rule lifecycle.
//!
//! ```text
//! CREATED -> SETUP -> GENERATING -> READY -> EXECUTING -> VALIDATING -> DONE
//!                                                    any stage -> FAILED
//! ```
//!
//! A rule that does not apply to the run's data stage never leaves
//! CREATED. Nothing is submitted before generation has produced a query
//! list that passes the sandbox check.

use crate::executor::{JobExecutor, JobResult};
use crate::report::RuleOutcome;
use crate::rule::{CleaningRule, RuleContext, RuleError, Validation};
use curation_core::{Coordinates, RunId};
use curation_plan::{promote_covering_writes, QuerySpec, SandboxValidator};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Lifecycle state of one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStage {
    /// Bound to coordinates, nothing run yet
    Created,
    /// Running rule-specific preconditions
    Setup,
    /// Producing the query list
    Generating,
    /// Query list checked and ready to submit
    Ready,
    /// Statements are being submitted
    Executing,
    /// Checking the post-condition
    Validating,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
}

impl RuleStage {
    /// Upper-case name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Setup => "SETUP",
            Self::Generating => "GENERATING",
            Self::Ready => "READY",
            Self::Executing => "EXECUTING",
            Self::Validating => "VALIDATING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the rule will not change stage again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `next` is a legal successor
    ///
    /// CREATED may go straight to GENERATING when only listing queries.
    #[must_use]
    pub fn can_advance_to(&self, next: RuleStage) -> bool {
        use RuleStage::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Created, Setup | Generating)
            | (Setup, Generating)
            | (Generating, Ready)
            | (Ready, Executing)
            | (Executing, Validating)
            | (Validating, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RuleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a rule failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Setup raised an error
    Setup,
    /// The rule could not produce its queries
    Generation,
    /// A destructive statement has no preceding sandbox write
    SandboxViolation,
    /// A statement failed permanently
    Execution {
        /// Position of the failed statement
        statement: usize,
    },
    /// The post-condition does not hold
    Validation,
    /// The engine could not drive the rule
    Internal,
}

/// Why a rule reached FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFailure {
    /// Stage the rule was in
    pub stage: RuleStage,
    /// Category
    #[serde(flatten)]
    pub kind: FailureKind,
    /// Underlying error
    pub message: String,
}

impl RuleFailure {
    /// Create a failure
    #[must_use]
    pub fn new(stage: RuleStage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Execution { statement } => {
                write!(f, "{} (statement {statement}): {}", self.stage, self.message)
            }
            _ => write!(f, "{}: {}", self.stage, self.message),
        }
    }
}

/// Drives one rule through its lifecycle
pub struct RuleRunner<'a> {
    rule: &'a dyn CleaningRule,
    coords: &'a Coordinates,
    run_id: RunId,
    generation_attempts: u32,
    stage: RuleStage,
}

impl<'a> RuleRunner<'a> {
    /// Bind a rule to a run's coordinates
    #[must_use]
    pub fn new(rule: &'a dyn CleaningRule, coords: &'a Coordinates, run_id: RunId) -> Self {
        Self {
            rule,
            coords,
            run_id,
            generation_attempts: 1,
            stage: RuleStage::Created,
        }
    }

    /// Attempt generation up to `attempts` times
    #[must_use]
    pub fn with_generation_attempts(mut self, attempts: u32) -> Self {
        self.generation_attempts = attempts.max(1);
        self
    }

    /// Current stage
    #[must_use]
    pub fn stage(&self) -> RuleStage {
        self.stage
    }

    /// Whether the rule applies to the run's data stage
    #[must_use]
    pub fn is_applicable(&self) -> bool {
        self.rule.descriptor().applies_to(self.coords.stage)
    }

    fn enter(&mut self, next: RuleStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.stage
        );
        debug!(from = %self.stage, to = %next, "rule stage");
        self.stage = next;
    }

    fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> RuleFailure {
        let failure = RuleFailure::new(self.stage, kind, message);
        error!(stage = %self.stage, error = %failure.message, "rule failed");
        self.stage = RuleStage::Failed;
        failure
    }

    fn cancelled(&self, statements_completed: usize) -> RuleOutcome {
        info!(stage = %self.stage, statements_completed, "rule cancelled");
        RuleOutcome::Cancelled {
            stage: self.stage,
            statements_completed,
        }
    }

    fn query_specs_with_retry(&self) -> Result<Vec<QuerySpec>, RuleError> {
        let mut attempt = 1;
        loop {
            match self.rule.query_specs(self.coords) {
                Ok(queries) => return Ok(queries),
                Err(err) if attempt < self.generation_attempts => {
                    warn!(attempt, error = %err, "query generation failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run GENERATING: build the query list and check it
    ///
    /// Covering sandbox writes are made blocking so the audit copy exists
    /// before the destructive statement is submitted.
    ///
    /// # Errors
    ///
    /// Returns the failure if generation errors or the sandbox check fails
    pub fn generate(&mut self) -> Result<Vec<QuerySpec>, RuleFailure> {
        self.enter(RuleStage::Generating);
        let rule = self.rule;

        let mut queries = match self.query_specs_with_retry() {
            Ok(queries) => queries,
            Err(err) => return Err(self.fail(FailureKind::Generation, err.to_string())),
        };

        let names = rule.sandbox_names();
        let coverage = match SandboxValidator::new(self.coords).validate(rule.descriptor(), &names, &queries) {
            Ok(coverage) => coverage,
            Err(violations) => {
                let message = violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(self.fail(FailureKind::SandboxViolation, message));
            }
        };

        for &index in &coverage.appending_writes {
            warn!(
                statement = index,
                "sandbox write appends; re-running this rule adds duplicate audit rows"
            );
        }
        let promoted = promote_covering_writes(&mut queries, &coverage);
        if !promoted.is_empty() {
            debug!(statements = ?promoted, "sandbox writes made blocking");
        }

        self.enter(RuleStage::Ready);
        Ok(queries)
    }

    /// Run the full lifecycle
    pub async fn run(mut self, executor: &JobExecutor) -> RuleOutcome {
        let rule = self.rule;
        let coords = self.coords;
        let descriptor = rule.descriptor();

        if !self.is_applicable() {
            info!(stage = ?coords.stage, "rule does not apply to this stage");
            return RuleOutcome::NotApplicable {
                stage: coords.stage,
            };
        }
        if executor.is_cancelled() {
            return self.cancelled(0);
        }

        let ctx = RuleContext::new(self.run_id, &descriptor.id, coords, executor);

        self.enter(RuleStage::Setup);
        match rule.setup(&ctx).await {
            Ok(()) => {}
            Err(RuleError::Cancelled) => return self.cancelled(0),
            Err(err) => {
                return RuleOutcome::Failed {
                    failure: self.fail(FailureKind::Setup, err.to_string()),
                }
            }
        }

        let queries = match self.generate() {
            Ok(queries) => queries,
            Err(failure) => return RuleOutcome::Failed { failure },
        };

        self.enter(RuleStage::Executing);
        info!(statements = queries.len(), "executing rule");
        let results = ctx.run_statements(&queries).await;
        let completed = results.iter().filter(|r| r.succeeded()).count();

        if let Some((index, cause)) = results
            .iter()
            .find_map(|r| r.failure().map(|cause| (r.index, cause.to_string())))
        {
            return RuleOutcome::Failed {
                failure: self.fail(FailureKind::Execution { statement: index }, cause),
            };
        }
        if results.iter().any(JobResult::cancelled) {
            return self.cancelled(completed);
        }

        self.enter(RuleStage::Validating);
        let validated = match rule.validate(&ctx).await {
            Ok(Validation::Passed) => true,
            Ok(Validation::NotImplemented) => false,
            Ok(Validation::Failed { reason }) => {
                return RuleOutcome::Failed {
                    failure: self.fail(FailureKind::Validation, reason),
                }
            }
            Err(RuleError::Cancelled) => return self.cancelled(completed),
            Err(err) => {
                return RuleOutcome::Failed {
                    failure: self.fail(FailureKind::Validation, err.to_string()),
                }
            }
        };

        self.enter(RuleStage::Done);
        info!(statements = completed, validated, "rule done");
        RuleOutcome::Done {
            statements: completed,
            validated,
        }
    }
}
