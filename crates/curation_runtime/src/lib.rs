//! Curation Engine Runtime
//!
//! Runs cleaning rules against a warehouse: submits generated statements
//! as jobs, retries transient failures, drives each rule through its
//! lifecycle, and schedules rules with bounded parallelism in dependency
//! order. Produces a per-run report.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod engine;
pub mod executor;
pub mod lifecycle;
pub mod memory;
pub mod monitor;
pub mod report;
pub mod retry;
pub mod rule;
pub mod scheduler;
pub mod sql_rule;
pub mod warehouse;

pub use catalog::{CatalogError, RuleCatalog, RuleCatalogBuilder};
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineController, EngineError, RuleQueries};
pub use executor::{batches, FailureCause, JobError, JobExecutor, JobOutcome, JobResult};
pub use lifecycle::{FailureKind, RuleFailure, RuleRunner, RuleStage};
pub use memory::{JournalEntry, MemoryWarehouse, ScriptedOutcome};
pub use monitor::{MetricsSnapshot, RunMetrics};
pub use report::{CancelReason, PipelineError, Report, RuleOutcome, RuleReport, RunStatus};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use rule::{CleaningRule, RuleContext, RuleError, Validation};
pub use scheduler::{ScheduleDecision, Scheduler, Settled};
pub use sql_rule::{CatalogFile, QueryTemplate, RuleEntry, SqlRule};
pub use warehouse::{
    JobErrorDetail, JobHandle, JobRequest, JobState, WarehouseClient, WarehouseError,
    TRANSIENT_REASONS,
};
