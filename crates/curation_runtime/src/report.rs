//! Run report.
//!
//! The report is the single record of what a run did: one outcome per
//! resolved rule, in execution order, plus the run's metrics.

use crate::lifecycle::{RuleFailure, RuleStage};
use crate::monitor::MetricsSnapshot;
use chrono::{DateTime, Utc};
use curation_core::{Coordinates, DataStage, RuleId, RunId};
use serde::Serialize;
use std::fmt::Write as _;

/// Terminal outcome of one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOutcome {
    /// Every statement succeeded and validation passed or was not implemented
    Done {
        /// Statements executed
        statements: usize,
        /// Whether a post-condition was checked
        validated: bool,
    },
    /// The rule failed
    Failed {
        /// Stage, category, and cause
        failure: RuleFailure,
    },
    /// A declared dependency failed or was skipped; never attempted
    SkippedDependencyFailed {
        /// Declared dependencies that did not complete
        failed_dependencies: Vec<RuleId>,
    },
    /// The rule does not apply to the run's data stage
    NotApplicable {
        /// Stage of the run
        stage: Option<DataStage>,
    },
    /// The run was cancelled before the rule finished
    Cancelled {
        /// Stage the rule was in
        stage: RuleStage,
        /// Statements that completed before cancellation
        statements_completed: usize,
    },
}

impl RuleOutcome {
    /// Upper-case status name
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Done { .. } => "DONE",
            Self::Failed { .. } => "FAILED",
            Self::SkippedDependencyFailed { .. } => "SKIPPED_DEPENDENCY_FAILED",
            Self::NotApplicable { .. } => "NOT_APPLICABLE",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }

    /// Whether dependents of this rule may run
    #[must_use]
    pub const fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::NotApplicable { .. })
    }
}

/// One rule's entry in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    /// Rule id
    pub rule: RuleId,
    /// Issue/ticket tags of the rule
    pub identifiers: Vec<String>,
    /// Outcome
    #[serde(flatten)]
    pub outcome: RuleOutcome,
    /// Wall time from start to outcome
    pub elapsed_ms: u64,
}

/// Why a run was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The cancellation token was triggered
    Operator,
    /// The run deadline passed
    Timeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operator => f.write_str("operator abort"),
            Self::Timeout => f.write_str("run timeout"),
        }
    }
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// No rule failed
    Succeeded,
    /// At least one rule failed
    Failed,
    /// The run stopped before every rule finished
    Cancelled {
        /// Trigger
        reason: CancelReason,
    },
}

/// A run that did not complete cleanly
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// One or more rules failed
    #[error("{} rule(s) failed: {}; {} skipped", .failed.len(), join_ids(.failed), .skipped.len())]
    RulesFailed {
        /// Failed rules in execution order
        failed: Vec<RuleId>,
        /// Rules skipped because of those failures
        skipped: Vec<RuleId>,
    },

    /// The run was cancelled
    #[error("run cancelled ({reason}); {} rule(s) left to re-run", .rerun.len())]
    Cancelled {
        /// Trigger
        reason: CancelReason,
        /// Rules that did not complete
        rerun: Vec<RuleId>,
    },
}

fn join_ids(ids: &[RuleId]) -> String {
    ids.iter().map(RuleId::as_str).collect::<Vec<_>>().join(", ")
}

/// Everything a run did
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Run id
    pub run_id: RunId,
    /// Coordinates the run cleaned
    pub coordinates: Coordinates,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Overall result
    pub status: RunStatus,
    /// Outcomes in execution order
    pub rules: Vec<RuleReport>,
    /// Counters
    pub metrics: MetricsSnapshot,
}

impl Report {
    fn matching(&self, pred: impl Fn(&RuleOutcome) -> bool) -> Vec<&RuleReport> {
        self.rules.iter().filter(|r| pred(&r.outcome)).collect()
    }

    /// Rules that reached DONE
    #[must_use]
    pub fn done(&self) -> Vec<&RuleReport> {
        self.matching(|o| matches!(o, RuleOutcome::Done { .. }))
    }

    /// Rules that failed
    #[must_use]
    pub fn failed(&self) -> Vec<&RuleReport> {
        self.matching(|o| matches!(o, RuleOutcome::Failed { .. }))
    }

    /// Rules skipped because a dependency failed
    #[must_use]
    pub fn skipped(&self) -> Vec<&RuleReport> {
        self.matching(|o| matches!(o, RuleOutcome::SkippedDependencyFailed { .. }))
    }

    /// Rules that do not apply to the run's stage
    #[must_use]
    pub fn not_applicable(&self) -> Vec<&RuleReport> {
        self.matching(|o| matches!(o, RuleOutcome::NotApplicable { .. }))
    }

    /// Rules stopped by cancellation
    #[must_use]
    pub fn cancelled(&self) -> Vec<&RuleReport> {
        self.matching(|o| matches!(o, RuleOutcome::Cancelled { .. }))
    }

    /// Outcome of one rule
    #[must_use]
    pub fn outcome(&self, rule: &RuleId) -> Option<&RuleOutcome> {
        self.rules.iter().find(|r| &r.rule == rule).map(|r| &r.outcome)
    }

    /// Rules to request in a follow-up run: failed, skipped, and cancelled
    #[must_use]
    pub fn rerun_subset(&self) -> Vec<RuleId> {
        self.rules
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    RuleOutcome::Failed { .. }
                        | RuleOutcome::SkippedDependencyFailed { .. }
                        | RuleOutcome::Cancelled { .. }
                )
            })
            .map(|r| r.rule.clone())
            .collect()
    }

    /// Whether no rule failed and the run was not cancelled
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Turn a failed or cancelled run into an error
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] for a cancelled run and
    /// [`PipelineError::RulesFailed`] when any rule failed
    pub fn into_result(self) -> Result<Self, PipelineError> {
        let ids = |rules: Vec<&RuleReport>| rules.into_iter().map(|r| r.rule.clone()).collect();
        match self.status {
            RunStatus::Cancelled { reason } => Err(PipelineError::Cancelled {
                reason,
                rerun: self.rerun_subset(),
            }),
            RunStatus::Failed => Err(PipelineError::RulesFailed {
                failed: ids(self.failed()),
                skipped: ids(self.skipped()),
            }),
            RunStatus::Succeeded => Ok(self),
        }
    }

    /// Human-readable summary
    #[must_use]
    pub fn summary(&self) -> String {
        let status = match self.status {
            RunStatus::Succeeded => "succeeded".to_string(),
            RunStatus::Failed => "failed".to_string(),
            RunStatus::Cancelled { reason } => format!("cancelled: {reason}"),
        };
        let mut out = format!(
            "run {} {status}: {} done, {} failed, {} skipped, {} not applicable, {} cancelled ({} jobs, {} retries)",
            self.run_id,
            self.done().len(),
            self.failed().len(),
            self.skipped().len(),
            self.not_applicable().len(),
            self.cancelled().len(),
            self.metrics.jobs_submitted,
            self.metrics.jobs_retried,
        );

        for entry in &self.rules {
            let tags = if entry.identifiers.is_empty() {
                String::new()
            } else {
                format!(" [{}]", entry.identifiers.join(", "))
            };
            let detail = match &entry.outcome {
                RuleOutcome::Failed { failure } => failure.to_string(),
                RuleOutcome::SkippedDependencyFailed {
                    failed_dependencies,
                } => format!("dependency did not complete: {}", join_ids(failed_dependencies)),
                RuleOutcome::Cancelled { stage, .. } => format!("stopped in {stage}"),
                _ => continue,
            };
            let _ = write!(
                out,
                "\n  {} {}{tags}: {detail}",
                entry.outcome.label(),
                entry.rule
            );
        }

        let rerun = self.rerun_subset();
        if !rerun.is_empty() {
            let _ = write!(out, "\n  re-run: {}", join_ids(&rerun));
        }
        out
    }

    /// Pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::FailureKind;

    fn id(name: &str) -> RuleId {
        RuleId::new(name).unwrap()
    }

    fn entry(name: &str, outcome: RuleOutcome) -> RuleReport {
        RuleReport {
            rule: id(name),
            identifiers: vec![format!("DC-{}", name.len())],
            outcome,
            elapsed_ms: 1,
        }
    }

    fn report(status: RunStatus, rules: Vec<RuleReport>) -> Report {
        Report {
            run_id: RunId::new(),
            coordinates: Coordinates::new("p", "d", "s").unwrap(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status,
            rules,
            metrics: MetricsSnapshot::default(),
        }
    }

    fn failed() -> RuleOutcome {
        RuleOutcome::Failed {
            failure: RuleFailure::new(
                RuleStage::Executing,
                FailureKind::Execution { statement: 1 },
                "permanent: invalidQuery: bad column",
            ),
        }
    }

    #[test]
    fn test_partitions_and_rerun() {
        let r = report(
            RunStatus::Failed,
            vec![
                entry("a", failed()),
                entry(
                    "b",
                    RuleOutcome::SkippedDependencyFailed {
                        failed_dependencies: vec![id("a")],
                    },
                ),
                entry(
                    "c",
                    RuleOutcome::Done {
                        statements: 2,
                        validated: false,
                    },
                ),
                entry("d", RuleOutcome::NotApplicable { stage: None }),
            ],
        );

        assert_eq!(r.done().len(), 1);
        assert_eq!(r.failed().len(), 1);
        assert_eq!(r.skipped().len(), 1);
        assert_eq!(r.not_applicable().len(), 1);
        assert_eq!(r.rerun_subset(), vec![id("a"), id("b")]);
        assert!(!r.is_success());

        let summary = r.summary();
        assert!(summary.contains("1 done, 1 failed, 1 skipped"));
        assert!(summary.contains("FAILED a [DC-1]: EXECUTING (statement 1)"));
        assert!(summary.contains("SKIPPED_DEPENDENCY_FAILED b"));
        assert!(summary.contains("re-run: a, b"));
    }

    #[test]
    fn test_into_result() {
        let ok = report(
            RunStatus::Succeeded,
            vec![entry(
                "a",
                RuleOutcome::Done {
                    statements: 1,
                    validated: true,
                },
            )],
        );
        assert!(ok.into_result().is_ok());

        let err = report(RunStatus::Failed, vec![entry("a", failed())])
            .into_result()
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::RulesFailed {
                failed: vec![id("a")],
                skipped: vec![],
            }
        );
        assert_eq!(err.to_string(), "1 rule(s) failed: a; 0 skipped");

        let cancelled = report(
            RunStatus::Cancelled {
                reason: CancelReason::Timeout,
            },
            vec![entry(
                "a",
                RuleOutcome::Cancelled {
                    stage: RuleStage::Created,
                    statements_completed: 0,
                },
            )],
        )
        .into_result()
        .unwrap_err();
        assert!(matches!(
            cancelled,
            PipelineError::Cancelled {
                reason: CancelReason::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn test_json_shape() {
        let r = report(RunStatus::Failed, vec![entry("a", failed())]);
        let json: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();

        assert_eq!(json["status"]["state"], "failed");
        assert_eq!(json["rules"][0]["status"], "FAILED");
        assert_eq!(json["rules"][0]["failure"]["stage"], "EXECUTING");
        assert_eq!(json["rules"][0]["failure"]["kind"], "execution");
        assert_eq!(json["rules"][0]["failure"]["statement"], 1);
        assert!(json["run_id"].is_string());
    }
}
