//! Engine controller.
//!
//! Resolves the requested rules into an execution order, then drives each
//! rule through its lifecycle with bounded parallelism. Rule failures are
//! recorded in the report and never abort the run; configuration errors
//! abort before anything is submitted.

use crate::catalog::RuleCatalog;
use crate::config::{ConfigError, EngineConfig};
use crate::executor::JobExecutor;
use crate::lifecycle::{FailureKind, RuleFailure, RuleRunner, RuleStage};
use crate::monitor::RunMetrics;
use crate::report::{CancelReason, Report, RuleOutcome, RuleReport, RunStatus};
use crate::scheduler::{ScheduleDecision, Scheduler, Settled};
use crate::warehouse::WarehouseClient;
use chrono::Utc;
use curation_core::{Coordinates, CoreError, RuleId, RunId};
use curation_plan::{ExecutionOrder, QuerySpec, ResolveError};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Error that stops a run before any rule executes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Engine configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Requested rules cannot be ordered
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Run coordinates are invalid
    #[error("invalid coordinates: {0}")]
    Coordinates(#[from] CoreError),
}

/// Generated queries of one rule, from a dry run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQueries {
    /// Rule id
    pub rule: RuleId,
    /// Issue/ticket tags
    pub identifiers: Vec<String>,
    /// Whether the rule applies to the run's data stage
    pub applicable: bool,
    /// Checked query list, or why generation failed
    pub queries: Result<Vec<QuerySpec>, RuleFailure>,
}

/// Top-level coordinator
pub struct EngineController {
    catalog: RuleCatalog,
    warehouse: Arc<dyn WarehouseClient>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl EngineController {
    /// Create a controller
    ///
    /// # Errors
    ///
    /// Returns error if `config` is invalid
    pub fn new(
        catalog: RuleCatalog,
        warehouse: Arc<dyn WarehouseClient>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            catalog,
            warehouse,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that aborts runs of this controller when cancelled
    ///
    /// Cancelling stops new submissions, asks the warehouse to stop
    /// in-flight jobs, waits out the ones it cannot stop, and reports
    /// unstarted rules as cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The configuration in use
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The rule catalog
    #[must_use]
    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Resolve `requested` (everything when empty) into an execution order
    ///
    /// # Errors
    ///
    /// Returns error on unknown rules or dependency cycles
    pub fn resolve(&self, requested: &[RuleId]) -> Result<ExecutionOrder, EngineError> {
        let resolver = self.catalog.resolver()?;
        let order = if requested.is_empty() {
            resolver.resolve_all()?
        } else {
            resolver.resolve(requested)?
        };
        Ok(order)
    }

    /// Generate and check every resolved rule's queries without running
    /// setup or submitting anything
    ///
    /// # Errors
    ///
    /// Returns error if the coordinates are invalid or resolution fails
    pub fn list_queries(
        &self,
        requested: &[RuleId],
        coords: &Coordinates,
    ) -> Result<Vec<RuleQueries>, EngineError> {
        coords.validate()?;
        let order = self.resolve(requested)?;
        let run_id = RunId::new();

        let listing = order
            .ids()
            .iter()
            .filter_map(|id| self.catalog.get(id).map(|rule| (id, rule)))
            .map(|(id, rule)| {
                let _span = info_span!("rule", rule = %id).entered();
                let mut runner = RuleRunner::new(rule.as_ref(), coords, run_id)
                    .with_generation_attempts(self.config.generation_attempts);
                RuleQueries {
                    rule: id.clone(),
                    identifiers: rule.descriptor().identifiers.iter().cloned().collect(),
                    applicable: runner.is_applicable(),
                    queries: runner.generate(),
                }
            })
            .collect();
        Ok(listing)
    }

    /// Execute `requested` (everything when empty) against `coords`
    ///
    /// # Errors
    ///
    /// Returns error only for configuration problems found before any rule
    /// runs; rule failures are in the report
    pub async fn execute(
        &self,
        requested: &[RuleId],
        coords: &Coordinates,
    ) -> Result<Report, EngineError> {
        coords.validate()?;
        let order = self.resolve(requested)?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let metrics = Arc::new(RunMetrics::new());
        let run_token = self.cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));

        let watchdog = self.config.run_timeout().map(|timeout| {
            let token = run_token.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "run timeout reached, cancelling"
                );
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let executor = JobExecutor::new(self.warehouse.clone(), &self.config)
            .with_cancellation(run_token.clone())
            .with_metrics(metrics.clone());

        info!(
            run = %run_id,
            rules = order.len(),
            project = %coords.project,
            dataset = %coords.dataset,
            sandbox = %coords.sandbox_dataset,
            "starting run"
        );

        let mut scheduler = Scheduler::new(&order);
        let mut outcomes: IndexMap<RuleId, (RuleOutcome, u64)> = IndexMap::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if run_token.is_cancelled() {
                for id in scheduler.cancel_pending() {
                    metrics.record_rule_cancelled();
                    outcomes.insert(id, (never_started(), 0));
                }
            }

            while in_flight.len() < self.config.max_parallel_rules && !run_token.is_cancelled() {
                match scheduler.decide() {
                    ScheduleDecision::Run(id) => {
                        scheduler.mark_started(&id);
                        in_flight.push(self.run_rule(id, coords, run_id, &executor));
                    }
                    ScheduleDecision::Skip {
                        rule,
                        failed_dependencies,
                    } => {
                        warn!(rule = %rule, dependencies = ?failed_dependencies, "skipping rule, dependency did not complete");
                        scheduler.mark_settled(&rule, Settled::Skipped);
                        metrics.record_rule_skipped();
                        outcomes.insert(
                            rule,
                            (
                                RuleOutcome::SkippedDependencyFailed {
                                    failed_dependencies,
                                },
                                0,
                            ),
                        );
                    }
                    ScheduleDecision::Wait | ScheduleDecision::Complete => break,
                }
            }

            let Some((id, outcome, elapsed_ms)) = in_flight.next().await else {
                break;
            };
            scheduler.mark_settled(&id, Settled::from(&outcome));
            record_outcome(&metrics, &outcome);
            outcomes.insert(id, (outcome, elapsed_ms));
        }

        for id in scheduler.cancel_pending() {
            metrics.record_rule_cancelled();
            outcomes.insert(id, (never_started(), 0));
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let rules: Vec<RuleReport> = order
            .iter()
            .filter_map(|descriptor| {
                let (outcome, elapsed_ms) = outcomes.shift_remove(&descriptor.id)?;
                Some(RuleReport {
                    rule: descriptor.id.clone(),
                    identifiers: descriptor.identifiers.iter().cloned().collect(),
                    outcome,
                    elapsed_ms,
                })
            })
            .collect();

        let any_cancelled = rules
            .iter()
            .any(|r| matches!(r.outcome, RuleOutcome::Cancelled { .. }));
        let any_failed = rules
            .iter()
            .any(|r| matches!(r.outcome, RuleOutcome::Failed { .. }));
        let status = if run_token.is_cancelled() && any_cancelled {
            let reason = if timed_out.load(Ordering::SeqCst) {
                CancelReason::Timeout
            } else {
                CancelReason::Operator
            };
            RunStatus::Cancelled { reason }
        } else if any_failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let report = Report {
            run_id,
            coordinates: coords.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            rules,
            metrics: metrics.snapshot(),
        };
        info!(run = %run_id, status = ?report.status, "{}", report.summary());
        Ok(report)
    }

    async fn run_rule(
        &self,
        id: RuleId,
        coords: &Coordinates,
        run_id: RunId,
        executor: &JobExecutor,
    ) -> (RuleId, RuleOutcome, u64) {
        let started = Instant::now();
        let outcome = match self.catalog.get(&id) {
            Some(rule) => {
                let span = info_span!("rule", rule = %id);
                RuleRunner::new(rule.as_ref(), coords, run_id)
                    .with_generation_attempts(self.config.generation_attempts)
                    .run(executor)
                    .instrument(span)
                    .await
            }
            None => RuleOutcome::Failed {
                failure: RuleFailure::new(
                    RuleStage::Created,
                    FailureKind::Internal,
                    "rule is not in the catalog",
                ),
            },
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        (id, outcome, elapsed_ms)
    }
}

fn never_started() -> RuleOutcome {
    RuleOutcome::Cancelled {
        stage: RuleStage::Created,
        statements_completed: 0,
    }
}

fn record_outcome(metrics: &RunMetrics, outcome: &RuleOutcome) {
    match outcome {
        RuleOutcome::Done { .. } => metrics.record_rule_done(),
        RuleOutcome::Failed { .. } => metrics.record_rule_failed(),
        RuleOutcome::SkippedDependencyFailed { .. } => metrics.record_rule_skipped(),
        RuleOutcome::NotApplicable { .. } => metrics.record_rule_not_applicable(),
        RuleOutcome::Cancelled { .. } => metrics.record_rule_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWarehouse;
    use crate::sql_rule::{QueryTemplate, SqlRule};
    use curation_plan::RuleDescriptor;
    use std::time::Duration;

    fn id(name: &str) -> RuleId {
        RuleId::new(name).unwrap()
    }

    fn coords() -> Coordinates {
        Coordinates::new("p", "combined", "combined_sandbox").unwrap()
    }

    fn cleaning_rule(name: &str, table: &str, deps: &[&str]) -> SqlRule {
        let mut descriptor = RuleDescriptor::new(id(name), name).with_affected_table(table);
        for dep in deps {
            descriptor = descriptor.with_dependency(id(dep));
        }
        SqlRule::new(descriptor)
            .with_query(
                QueryTemplate::new(format!("SELECT {name}"))
                    .to(format!("sandbox:{table}")),
            )
            .with_query(QueryTemplate::new(format!("DELETE {name}")).mutating(table))
    }

    fn controller(rules: Vec<SqlRule>, wh: Arc<MemoryWarehouse>) -> EngineController {
        let catalog = rules
            .into_iter()
            .try_fold(RuleCatalog::builder(), |b, r| b.register(r))
            .unwrap()
            .build()
            .unwrap();
        let config = EngineConfig::new().with_poll_interval(Duration::from_millis(10));
        EngineController::new(catalog, wh, config).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let catalog = RuleCatalog::builder().build().unwrap();
        let result = EngineController::new(
            catalog,
            Arc::new(MemoryWarehouse::new()),
            EngineConfig::new().with_max_parallel_rules(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_rule() {
        let engine = controller(vec![cleaning_rule("a", "x", &[])], Arc::new(MemoryWarehouse::new()));
        let err = engine.resolve(&[id("zzz")]).unwrap_err();
        assert!(matches!(err, EngineError::Resolve(ResolveError::UnknownRule { .. })));
    }

    #[test]
    fn test_list_queries_submits_nothing() {
        let wh = Arc::new(MemoryWarehouse::new());
        let unsandboxed = SqlRule::new(RuleDescriptor::new(id("bad"), "").with_affected_table("t"))
            .with_query(QueryTemplate::new("DELETE t").mutating("t"));
        let engine = controller(vec![cleaning_rule("a", "x", &[]), unsandboxed], wh.clone());

        let listing = engine.list_queries(&[], &coords()).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].queries.as_ref().unwrap().len(), 2);
        assert!(listing[0].applicable);
        assert_eq!(
            listing[1].queries.as_ref().unwrap_err().kind,
            FailureKind::SandboxViolation
        );
        assert!(wh.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_all_done() {
        let wh = Arc::new(MemoryWarehouse::new());
        let engine = controller(
            vec![cleaning_rule("a", "x", &[]), cleaning_rule("b", "y", &["a"])],
            wh.clone(),
        );
        let report = engine.execute(&[], &coords()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.done().len(), 2);
        assert_eq!(report.metrics.jobs_submitted, 4);
        assert_eq!(report.metrics.rules_done, 2);
        assert_eq!(wh.statements(), vec!["SELECT a", "DELETE a", "SELECT b", "DELETE b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_execute() {
        let wh = Arc::new(MemoryWarehouse::new());
        let engine = controller(vec![cleaning_rule("a", "x", &[])], wh.clone());
        engine.cancellation_token().cancel();

        let report = engine.execute(&[], &coords()).await.unwrap();
        assert_eq!(
            report.status,
            RunStatus::Cancelled {
                reason: CancelReason::Operator
            }
        );
        assert_eq!(report.cancelled().len(), 1);
        assert!(wh.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_coordinates() {
        let engine = controller(vec![cleaning_rule("a", "x", &[])], Arc::new(MemoryWarehouse::new()));
        let mut bad = coords();
        bad.sandbox_dataset = bad.dataset.clone();
        let err = engine.execute(&[], &bad).await.unwrap_err();
        assert!(matches!(err, EngineError::Coordinates(_)));
    }
}
