//! Job executor: submits a rule's statements to the warehouse.
//!
//! Statements run in declared order. A maximal run of consecutive
//! non-blocking statements is one batch, submitted together and awaited
//! together; a blocking statement is a batch of its own. A batch finishes
//! before the next one is submitted.
//!
//! Transient failures are retried with backoff up to the retry budget. A
//! job that ends in a transient error is resubmitted; a failed status check
//! polls the same job again, so a statement never has two live jobs.
//! A permanent failure stops the rule: later batches are not submitted and
//! earlier successes are left in place.

use crate::config::EngineConfig;
use crate::monitor::RunMetrics;
use crate::retry::RetryPolicy;
use crate::warehouse::{JobErrorDetail, JobHandle, JobRequest, JobState, WarehouseClient, WarehouseError};
use curation_core::JobId;
use curation_plan::QuerySpec;
use futures::future::join_all;
use indexmap::IndexMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why one attempt at a job failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job reached an error state
    #[error("{0}")]
    Job(JobErrorDetail),
    /// The client call failed
    #[error(transparent)]
    Client(#[from] WarehouseError),
}

impl JobError {
    /// Whether resubmitting may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Job(detail) => detail.is_transient(),
            Self::Client(err) => err.transient,
        }
    }
}

/// Why a statement failed permanently
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureCause {
    /// The error is not worth retrying
    #[error("permanent: {0}")]
    Permanent(JobError),
    /// Transient errors outlasted the retry budget
    #[error("permanent: retry budget exhausted after {retries} retries (last error: {last})")]
    RetryBudgetExhausted {
        /// Retries performed
        retries: u32,
        /// Error of the final attempt
        last: JobError,
    },
}

/// What happened to one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job finished successfully
    Succeeded {
        /// Job of the successful attempt
        job: JobId,
        /// Submissions made, first included
        attempts: u32,
    },
    /// The statement failed permanently
    Failed {
        /// Classification of the failure
        cause: FailureCause,
        /// Submissions made, first included
        attempts: u32,
    },
    /// An earlier statement failed, so this one was never submitted
    NotSubmitted,
    /// The run was cancelled before or while this statement ran
    Cancelled {
        /// Job that was stopped, if one had been submitted
        job: Option<JobId>,
    },
}

/// Outcome of the statement at `index` of a rule's query list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// Position in the query list
    pub index: usize,
    /// What happened
    pub outcome: JobOutcome,
}

impl JobResult {
    /// Whether the statement succeeded
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded { .. })
    }

    /// Failure cause, if the statement failed
    #[must_use]
    pub fn failure(&self) -> Option<&FailureCause> {
        match &self.outcome {
            JobOutcome::Failed { cause, .. } => Some(cause),
            _ => None,
        }
    }

    /// Whether cancellation stopped the statement
    #[must_use]
    pub fn cancelled(&self) -> bool {
        matches!(self.outcome, JobOutcome::Cancelled { .. })
    }
}

/// Consecutive statement ranges that are submitted together
#[must_use]
pub fn batches(queries: &[QuerySpec]) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, query) in queries.iter().enumerate() {
        if query.is_blocking {
            if start < i {
                out.push(start..i);
            }
            out.push(i..i + 1);
            start = i + 1;
        }
    }
    if start < queries.len() {
        out.push(start..queries.len());
    }
    out
}

enum Waited {
    Succeeded,
    Errored(JobErrorDetail),
    Cancelled,
}

enum Backoff {
    Retry,
    GiveUp(FailureCause),
    Cancelled,
}

/// Submits statements and drives their jobs to completion
pub struct JobExecutor {
    warehouse: Arc<dyn WarehouseClient>,
    retry: RetryPolicy,
    poll_interval: Duration,
    cancel: CancellationToken,
    metrics: Arc<RunMetrics>,
}

impl JobExecutor {
    /// Create an executor using `config`'s retry policy and poll interval
    #[must_use]
    pub fn new(warehouse: Arc<dyn WarehouseClient>, config: &EngineConfig) -> Self {
        Self {
            warehouse,
            retry: config.retry.clone(),
            poll_interval: config.poll_interval(),
            cancel: CancellationToken::new(),
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    /// Stop submitting when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Record into shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The warehouse jobs are submitted to
    #[must_use]
    pub fn warehouse(&self) -> &dyn WarehouseClient {
        self.warehouse.as_ref()
    }

    /// Whether the run has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Metrics this executor records into
    #[must_use]
    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Run `queries` in order, one result per query
    pub async fn run(&self, queries: &[QuerySpec]) -> Vec<JobResult> {
        self.run_labeled(queries, &IndexMap::new()).await
    }

    /// Run `queries` in order, attaching `labels` to every job
    pub async fn run_labeled(
        &self,
        queries: &[QuerySpec],
        labels: &IndexMap<String, String>,
    ) -> Vec<JobResult> {
        let mut results = Vec::with_capacity(queries.len());
        let mut halted = false;

        for batch in batches(queries) {
            if halted {
                results.extend(batch.map(|index| JobResult {
                    index,
                    outcome: JobOutcome::NotSubmitted,
                }));
                continue;
            }
            if self.cancel.is_cancelled() {
                for index in batch {
                    self.metrics.record_job_cancelled();
                    results.push(JobResult {
                        index,
                        outcome: JobOutcome::Cancelled { job: None },
                    });
                }
                continue;
            }

            debug!(first = batch.start, len = batch.len(), "submitting batch");
            let requests: Vec<JobRequest> = queries[batch.clone()]
                .iter()
                .map(|query| {
                    let mut request = JobRequest::from(query);
                    request
                        .labels
                        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
                    request
                })
                .collect();
            let outcomes = join_all(
                batch
                    .clone()
                    .zip(&requests)
                    .map(|(index, request)| self.run_job(index, request)),
            )
            .await;

            for (index, outcome) in batch.zip(outcomes) {
                if matches!(outcome, JobOutcome::Failed { .. }) {
                    halted = true;
                }
                results.push(JobResult { index, outcome });
            }
        }

        results
    }

    async fn run_job(&self, index: usize, request: &JobRequest) -> JobOutcome {
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut live: Option<JobHandle> = None;
        loop {
            let handle = match live.take() {
                Some(handle) => handle,
                None => {
                    if self.cancel.is_cancelled() {
                        self.metrics.record_job_cancelled();
                        return JobOutcome::Cancelled { job: None };
                    }
                    attempts += 1;
                    match self.warehouse.submit(request).await {
                        Ok(handle) => {
                            self.metrics.record_submission();
                            debug!(job = %handle, "job submitted");
                            handle
                        }
                        Err(err) => match self.back_off(index, &mut retries, JobError::Client(err)).await {
                            Backoff::Retry => continue,
                            Backoff::GiveUp(cause) => return self.failed(cause, attempts),
                            Backoff::Cancelled => {
                                self.metrics.record_job_cancelled();
                                return JobOutcome::Cancelled { job: None };
                            }
                        },
                    }
                }
            };

            match self.wait(&handle).await {
                Ok(Waited::Succeeded) => {
                    self.metrics.record_job_success();
                    debug!(statement = index, job = %handle, attempts, "statement succeeded");
                    return JobOutcome::Succeeded {
                        job: handle.job_id,
                        attempts,
                    };
                }
                Ok(Waited::Cancelled) => {
                    self.metrics.record_job_cancelled();
                    return JobOutcome::Cancelled {
                        job: Some(handle.job_id),
                    };
                }
                Ok(Waited::Errored(detail)) => {
                    match self.back_off(index, &mut retries, JobError::Job(detail)).await {
                        Backoff::Retry => {}
                        Backoff::GiveUp(cause) => return self.failed(cause, attempts),
                        Backoff::Cancelled => {
                            self.metrics.record_job_cancelled();
                            return JobOutcome::Cancelled { job: None };
                        }
                    }
                }
                // The status check failed, not the job: it is still running
                // and must not be submitted a second time.
                Err(err) => match self.back_off(index, &mut retries, JobError::Client(err)).await {
                    Backoff::Retry | Backoff::Cancelled => live = Some(handle),
                    Backoff::GiveUp(cause) => {
                        if let Err(err) = self.warehouse.cancel(&handle).await {
                            warn!(job = %handle, error = %err, "failed to cancel abandoned job");
                        }
                        return self.failed(cause, attempts);
                    }
                },
            }
        }
    }

    fn failed(&self, cause: FailureCause, attempts: u32) -> JobOutcome {
        self.metrics.record_job_failure();
        JobOutcome::Failed { cause, attempts }
    }

    /// Spend one retry on `err` and sleep, unless it is permanent or the budget is gone
    async fn back_off(&self, index: usize, retries: &mut u32, err: JobError) -> Backoff {
        if !err.is_transient() {
            error!(statement = index, error = %err, "statement failed permanently");
            return Backoff::GiveUp(FailureCause::Permanent(err));
        }
        if !self.retry.allows_retry(*retries) {
            error!(statement = index, retries = *retries, error = %err, "retry budget exhausted");
            return Backoff::GiveUp(FailureCause::RetryBudgetExhausted {
                retries: *retries,
                last: err,
            });
        }

        *retries += 1;
        let delay = self.retry.delay_for(*retries);
        warn!(
            statement = index,
            retry = *retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "transient failure, retrying"
        );
        self.metrics.record_retry();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Backoff::Cancelled,
            () = tokio::time::sleep(delay) => Backoff::Retry,
        }
    }

    async fn wait(&self, handle: &JobHandle) -> Result<Waited, WarehouseError> {
        loop {
            match self.warehouse.poll(handle).await? {
                JobState::Pending => debug!(job = %handle, "job pending"),
                JobState::Success => return Ok(Waited::Succeeded),
                JobState::Error(detail) => return Ok(Waited::Errored(detail)),
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.stop(handle).await,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Cancel an in-flight job, or wait it out if the warehouse refuses
    async fn stop(&self, handle: &JobHandle) -> Result<Waited, WarehouseError> {
        match self.warehouse.cancel(handle).await {
            Ok(()) => {
                info!(job = %handle, "cancelled in-flight job");
                Ok(Waited::Cancelled)
            }
            Err(err) => {
                warn!(job = %handle, error = %err, "job cannot be cancelled, waiting for it to finish");
                loop {
                    match self.warehouse.poll(handle).await? {
                        JobState::Pending => tokio::time::sleep(self.poll_interval).await,
                        JobState::Success => return Ok(Waited::Succeeded),
                        JobState::Error(detail) => return Ok(Waited::Errored(detail)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryWarehouse, ScriptedOutcome};
    use curation_core::Coordinates;
    use curation_plan::WriteMode;

    fn coords() -> Coordinates {
        Coordinates::new("p", "d", "d_sandbox").unwrap()
    }

    fn config(max_retries: u32) -> EngineConfig {
        EngineConfig::new()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(RetryPolicy::default().with_max_retries(max_retries))
    }

    fn executor(wh: &Arc<MemoryWarehouse>, max_retries: u32) -> JobExecutor {
        JobExecutor::new(wh.clone(), &config(max_retries))
    }

    #[test]
    fn test_batches() {
        let q = |text: &str, blocking: bool| QuerySpec::statement(text).blocking(blocking);
        let queries = vec![
            q("a", false),
            q("b", false),
            q("c", true),
            q("d", true),
            q("e", false),
        ];
        assert_eq!(batches(&queries), vec![0..2, 2..3, 3..4, 4..5]);
        assert!(batches(&[]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_success() {
        let wh = Arc::new(MemoryWarehouse::new().with_polls_to_complete(3));
        let c = coords();
        let queries = vec![
            QuerySpec::to_table("SELECT copy", c.sandbox_table("r_obs"), WriteMode::Truncate),
            QuerySpec::mutation("DELETE obs", "obs"),
        ];
        let results = executor(&wh, 3).run(&queries).await;

        assert!(results.iter().all(JobResult::succeeded));
        assert_eq!(wh.statements(), vec!["SELECT copy", "DELETE obs"]);
        assert_eq!(wh.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_batch_runs_together() {
        let wh = Arc::new(MemoryWarehouse::new().with_polls_to_complete(2));
        let queries = vec![
            QuerySpec::statement("one").blocking(false),
            QuerySpec::statement("two").blocking(false),
            QuerySpec::statement("three").blocking(false),
        ];
        let results = executor(&wh, 0).run(&queries).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(JobResult::succeeded));
        assert_eq!(wh.peak_in_flight(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.script(
            "flaky",
            [
                ScriptedOutcome::error("rateLimitExceeded", "slow down"),
                ScriptedOutcome::RejectSubmit(WarehouseError::transient("connection reset")),
            ],
        );
        let exec = executor(&wh, 3);
        let results = exec.run(&[QuerySpec::statement("SELECT flaky")]).await;

        assert!(matches!(results[0].outcome, JobOutcome::Succeeded { attempts: 3, .. }));
        assert_eq!(exec.metrics().snapshot().jobs_retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.script("flaky", vec![ScriptedOutcome::error("backendError", "oops"); 5]);
        let results = executor(&wh, 2).run(&[QuerySpec::statement("SELECT flaky")]).await;

        let cause = results[0].failure().unwrap();
        assert!(matches!(cause, FailureCause::RetryBudgetExhausted { retries: 2, .. }));
        assert!(cause.to_string().starts_with("permanent: retry budget exhausted"));
        assert_eq!(wh.submissions_matching("flaky"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_stops_rule() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.script("broken", [ScriptedOutcome::error("invalidQuery", "syntax error")]);
        let queries = vec![
            QuerySpec::statement("ok"),
            QuerySpec::statement("broken"),
            QuerySpec::statement("after").blocking(false),
            QuerySpec::statement("after_too"),
        ];
        let results = executor(&wh, 3).run(&queries).await;

        assert!(results[0].succeeded());
        assert!(matches!(
            results[1].outcome,
            JobOutcome::Failed { cause: FailureCause::Permanent(_), attempts: 1 }
        ));
        assert_eq!(results[2].outcome, JobOutcome::NotSubmitted);
        assert_eq!(results[3].outcome, JobOutcome::NotSubmitted);
        assert_eq!(wh.submissions_matching("after"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_client_error() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.script("x", [ScriptedOutcome::RejectSubmit(WarehouseError::permanent("denied"))]);
        let results = executor(&wh, 3).run(&[QuerySpec::statement("x")]).await;
        assert!(matches!(
            results[0].failure(),
            Some(FailureCause::Permanent(JobError::Client(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let wh = Arc::new(MemoryWarehouse::new());
        let token = CancellationToken::new();
        token.cancel();
        let exec = executor(&wh, 3).with_cancellation(token);
        let results = exec.run(&[QuerySpec::statement("a"), QuerySpec::statement("b")]).await;

        assert!(results.iter().all(JobResult::cancelled));
        assert!(wh.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_job() {
        let wh = Arc::new(MemoryWarehouse::new().with_polls_to_complete(1_000));
        let token = CancellationToken::new();
        let exec = executor(&wh, 3).with_cancellation(token.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        };
        let queries = [QuerySpec::statement("long"), QuerySpec::statement("next")];
        let (results, ()) = tokio::join!(exec.run(&queries), canceller);

        assert!(matches!(results[0].outcome, JobOutcome::Cancelled { job: Some(_) }));
        assert!(matches!(results[1].outcome, JobOutcome::Cancelled { job: None }));
        assert_eq!(wh.cancel_requests().len(), 1);
        assert_eq!(wh.submissions_matching("next"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_cancellable_job_runs_to_completion() {
        let wh = Arc::new(
            MemoryWarehouse::new()
                .with_polls_to_complete(20)
                .with_cancellable(false),
        );
        let token = CancellationToken::new();
        let exec = executor(&wh, 3).with_cancellation(token.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        };
        let queries = [QuerySpec::statement("long"), QuerySpec::statement("next")];
        let (results, ()) = tokio::join!(exec.run(&queries), canceller);

        assert!(results[0].succeeded());
        assert!(results[1].cancelled());
        assert_eq!(wh.statements(), vec!["long"]);
    }

    fn audit_then_delete() -> Vec<QuerySpec> {
        vec![
            QuerySpec::to_table("INSERT audit", coords().sandbox_table("r_t"), WriteMode::Append),
            QuerySpec::mutation("DELETE t", "t"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_check_polls_same_job() {
        let wh = Arc::new(MemoryWarehouse::new().with_polls_to_complete(5));
        wh.script_poll_errors("INSERT audit", [WarehouseError::transient("connection reset")]);
        let exec = executor(&wh, 3);
        let results = exec.run(&audit_then_delete()).await;

        assert!(matches!(results[0].outcome, JobOutcome::Succeeded { attempts: 1, .. }));
        assert!(results[1].succeeded());
        assert_eq!(wh.submissions_matching("INSERT audit"), 1);
        assert_eq!(wh.statements(), vec!["INSERT audit", "DELETE t"]);
        assert_eq!(wh.peak_in_flight(), 1);
        assert!(wh.cancel_requests().is_empty());
        assert_eq!(exec.metrics().snapshot().jobs_retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_checks_exhaust_budget_and_cancel_job() {
        let wh = Arc::new(MemoryWarehouse::new().with_polls_to_complete(5));
        wh.script_poll_errors("INSERT audit", vec![WarehouseError::transient("connection reset"); 10]);
        let results = executor(&wh, 2).run(&audit_then_delete()).await;

        assert!(matches!(
            results[0].outcome,
            JobOutcome::Failed {
                cause: FailureCause::RetryBudgetExhausted { retries: 2, last: JobError::Client(_) },
                attempts: 1,
            }
        ));
        assert_eq!(results[1].outcome, JobOutcome::NotSubmitted);
        assert_eq!(wh.submissions_matching("INSERT audit"), 1);
        assert_eq!(wh.cancel_requests().len(), 1);
        assert_eq!(wh.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_status_check_error_cancels_job() {
        let wh = Arc::new(MemoryWarehouse::new().with_polls_to_complete(5));
        wh.script_poll_errors("INSERT audit", [WarehouseError::permanent("job not found")]);
        let results = executor(&wh, 3).run(&audit_then_delete()).await;

        assert!(matches!(
            results[0].failure(),
            Some(FailureCause::Permanent(JobError::Client(_)))
        ));
        assert_eq!(wh.submissions_matching("INSERT audit"), 1);
        assert_eq!(wh.cancel_requests().len(), 1);
        assert_eq!(wh.submissions_matching("DELETE t"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_labels_attached() {
        let wh = Arc::new(MemoryWarehouse::new());
        let mut labels = IndexMap::new();
        labels.insert("rule".to_string(), "r1".to_string());
        executor(&wh, 0)
            .run_labeled(&[QuerySpec::statement("a")], &labels)
            .await;
        assert_eq!(wh.journal()[0].request.labels.get("rule").map(String::as_str), Some("r1"));
    }
}
