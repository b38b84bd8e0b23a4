//! Run metrics.
//!
//! Counters are shared between concurrently running rules, so they are
//! atomics behind a `&self` API. [`RunMetrics::snapshot`] freezes them for
//! the report.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one run
#[derive(Debug, Default)]
pub struct RunMetrics {
    jobs_submitted: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    rules_done: AtomicU64,
    rules_failed: AtomicU64,
    rules_skipped: AtomicU64,
    rules_not_applicable: AtomicU64,
    rules_cancelled: AtomicU64,
}

/// Frozen copy of [`RunMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Accepted job submissions, retries included
    pub jobs_submitted: u64,
    /// Resubmissions after a transient failure
    pub jobs_retried: u64,
    /// Jobs that finished successfully
    pub jobs_succeeded: u64,
    /// Statements that failed permanently
    pub jobs_failed: u64,
    /// Jobs stopped or never submitted because of cancellation
    pub jobs_cancelled: u64,
    /// Rules that reached DONE
    pub rules_done: u64,
    /// Rules that reached FAILED
    pub rules_failed: u64,
    /// Rules skipped because a dependency failed
    pub rules_skipped: u64,
    /// Rules that do not apply to the run's stage
    pub rules_not_applicable: u64,
    /// Rules stopped or never started because of cancellation
    pub rules_cancelled: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RunMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted submission
    pub fn record_submission(&self) {
        bump(&self.jobs_submitted);
    }

    /// Record a retry
    pub fn record_retry(&self) {
        bump(&self.jobs_retried);
    }

    /// Record a successful job
    pub fn record_job_success(&self) {
        bump(&self.jobs_succeeded);
    }

    /// Record a permanently failed statement
    pub fn record_job_failure(&self) {
        bump(&self.jobs_failed);
    }

    /// Record a cancelled job
    pub fn record_job_cancelled(&self) {
        bump(&self.jobs_cancelled);
    }

    /// Record a rule that reached DONE
    pub fn record_rule_done(&self) {
        bump(&self.rules_done);
    }

    /// Record a failed rule
    pub fn record_rule_failed(&self) {
        bump(&self.rules_failed);
    }

    /// Record a skipped rule
    pub fn record_rule_skipped(&self) {
        bump(&self.rules_skipped);
    }

    /// Record a rule that does not apply
    pub fn record_rule_not_applicable(&self) {
        bump(&self.rules_not_applicable);
    }

    /// Record a cancelled rule
    pub fn record_rule_cancelled(&self) {
        bump(&self.rules_cancelled);
    }

    /// Freeze current values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_submitted: load(&self.jobs_submitted),
            jobs_retried: load(&self.jobs_retried),
            jobs_succeeded: load(&self.jobs_succeeded),
            jobs_failed: load(&self.jobs_failed),
            jobs_cancelled: load(&self.jobs_cancelled),
            rules_done: load(&self.rules_done),
            rules_failed: load(&self.rules_failed),
            rules_skipped: load(&self.rules_skipped),
            rules_not_applicable: load(&self.rules_not_applicable),
            rules_cancelled: load(&self.rules_cancelled),
        }
    }
}

impl MetricsSnapshot {
    /// Share of submissions that were not retries (0.0 - 1.0)
    #[must_use]
    pub fn first_attempt_rate(&self) -> f64 {
        if self.jobs_submitted == 0 {
            return 1.0;
        }
        self.jobs_submitted.saturating_sub(self.jobs_retried) as f64 / self.jobs_submitted as f64
    }

    /// Rules with a terminal outcome
    #[must_use]
    pub fn rules_total(&self) -> u64 {
        self.rules_done
            + self.rules_failed
            + self.rules_skipped
            + self.rules_not_applicable
            + self.rules_cancelled
    }
}
