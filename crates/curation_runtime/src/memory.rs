//! In-process warehouse job system.
//!
//! Jobs never touch data. Each one completes after a fixed number of polls
//! with an outcome that defaults to success and can be scripted per
//! statement substring. Every submission is journaled so callers can check
//! exactly what was sent and in which order.

use crate::warehouse::{
    JobErrorDetail, JobHandle, JobRequest, JobState, WarehouseClient, WarehouseError,
};
use async_trait::async_trait;
use curation_core::JobId;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Scripted result of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// The job succeeds
    Succeed,
    /// The job ends with this error
    Fail(JobErrorDetail),
    /// The submit call itself fails
    RejectSubmit(WarehouseError),
}

impl ScriptedOutcome {
    /// A job error with `reason`
    #[must_use]
    pub fn error(reason: &str, message: &str) -> Self {
        Self::Fail(JobErrorDetail::new(reason, message))
    }
}

/// One submit call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Assigned job, `None` when the submission was rejected
    pub job_id: Option<JobId>,
    /// Request as submitted
    pub request: JobRequest,
}

struct Script {
    pattern: String,
    outcomes: VecDeque<ScriptedOutcome>,
}

struct PollScript {
    pattern: String,
    errors: VecDeque<WarehouseError>,
}

struct MemoryJob {
    statement: String,
    polls_left: u32,
    outcome: JobState,
    finished: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    jobs: IndexMap<JobId, MemoryJob>,
    journal: Vec<JournalEntry>,
    scripts: Vec<Script>,
    poll_scripts: Vec<PollScript>,
    cancel_requests: Vec<JobId>,
    in_flight: usize,
    peak_in_flight: usize,
}

impl State {
    fn next_outcome(&mut self, statement: &str) -> ScriptedOutcome {
        self.scripts
            .iter_mut()
            .filter(|s| statement.contains(s.pattern.as_str()))
            .find_map(|s| s.outcomes.pop_front())
            .unwrap_or(ScriptedOutcome::Succeed)
    }

    fn next_poll_error(&mut self, statement: &str) -> Option<WarehouseError> {
        self.poll_scripts
            .iter_mut()
            .filter(|s| statement.contains(s.pattern.as_str()))
            .find_map(|s| s.errors.pop_front())
    }

    fn finish(&mut self, id: &JobId) {
        if let Some(job) = self.jobs.get_mut(id) {
            if !job.finished {
                job.finished = true;
                self.in_flight = self.in_flight.saturating_sub(1);
            }
        }
    }
}

/// In-process [`WarehouseClient`]
pub struct MemoryWarehouse {
    state: Mutex<State>,
    polls_to_complete: u32,
    cancellable: bool,
}

impl MemoryWarehouse {
    /// Jobs complete on their first poll and can be cancelled
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            polls_to_complete: 1,
            cancellable: true,
        }
    }

    /// Number of polls before a job reaches its terminal state
    #[must_use]
    pub fn with_polls_to_complete(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls.max(1);
        self
    }

    /// Whether [`WarehouseClient::cancel`] stops jobs
    #[must_use]
    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Queue outcomes for statements containing `pattern`
    ///
    /// Matching submissions consume the queue in order; once it is empty
    /// they succeed. Earlier scripts win when several patterns match.
    pub fn script(&self, pattern: impl Into<String>, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.lock().scripts.push(Script {
            pattern: pattern.into(),
            outcomes: outcomes.into_iter().collect(),
        });
    }

    /// Fail status checks of jobs whose statement contains `pattern`
    ///
    /// Each poll of a matching job consumes one error; the job itself keeps
    /// running and is polled normally once the queue is empty.
    pub fn script_poll_errors(
        &self,
        pattern: impl Into<String>,
        errors: impl IntoIterator<Item = WarehouseError>,
    ) {
        self.lock().poll_scripts.push(PollScript {
            pattern: pattern.into(),
            errors: errors.into_iter().collect(),
        });
    }

    /// Every submit call so far
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Statements of accepted submissions, in submission order
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter(|e| e.job_id.is_some())
            .map(|e| e.request.statement.clone())
            .collect()
    }

    /// Submit calls whose statement contains `pattern`
    #[must_use]
    pub fn submissions_matching(&self, pattern: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|e| e.request.statement.contains(pattern))
            .count()
    }

    /// Jobs a cancel was requested for
    #[must_use]
    pub fn cancel_requests(&self) -> Vec<JobId> {
        self.lock().cancel_requests.clone()
    }

    /// Largest number of unfinished jobs seen at once
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, WarehouseError> {
        let mut state = self.lock();
        let outcome = match state.next_outcome(&request.statement) {
            ScriptedOutcome::RejectSubmit(err) => {
                state.journal.push(JournalEntry {
                    job_id: None,
                    request: request.clone(),
                });
                return Err(err);
            }
            ScriptedOutcome::Succeed => JobState::Success,
            ScriptedOutcome::Fail(detail) => JobState::Error(detail),
        };

        state.next_id += 1;
        let job_id = JobId::new(format!("job_{:06}", state.next_id));
        state.jobs.insert(
            job_id.clone(),
            MemoryJob {
                statement: request.statement.clone(),
                polls_left: self.polls_to_complete,
                outcome,
                finished: false,
            },
        );
        state.journal.push(JournalEntry {
            job_id: Some(job_id.clone()),
            request: request.clone(),
        });
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);

        Ok(JobHandle::new(job_id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, WarehouseError> {
        let mut state = self.lock();
        let Some(statement) = state.jobs.get(&handle.job_id).map(|job| job.statement.clone()) else {
            return Err(WarehouseError::permanent(format!("unknown job {handle}")));
        };
        if let Some(err) = state.next_poll_error(&statement) {
            return Err(err);
        }
        let Some(job) = state.jobs.get_mut(&handle.job_id) else {
            return Err(WarehouseError::permanent(format!("unknown job {handle}")));
        };
        if job.finished {
            return Ok(job.outcome.clone());
        }
        if job.polls_left > 1 {
            job.polls_left -= 1;
            return Ok(JobState::Pending);
        }
        let outcome = job.outcome.clone();
        state.finish(&handle.job_id);
        Ok(outcome)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        state.cancel_requests.push(handle.job_id.clone());
        if !self.cancellable {
            return Err(WarehouseError::permanent(format!("job {handle} cannot be cancelled")));
        }
        let Some(job) = state.jobs.get_mut(&handle.job_id) else {
            return Err(WarehouseError::permanent(format!("unknown job {handle}")));
        };
        if !job.finished {
            job.outcome = JobState::Error(JobErrorDetail::new("stopped", "job cancelled by request"));
        }
        state.finish(&handle.job_id);
        Ok(())
    }
}
