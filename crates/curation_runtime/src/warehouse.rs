//! Boundary to the warehouse job system.
//!
//! The engine submits statements as asynchronous jobs, polls them to a
//! terminal state, and may ask for in-flight jobs to be cancelled. Terminal
//! errors carry a machine-readable reason used to decide whether a job is
//! worth resubmitting.

use async_trait::async_trait;
use curation_core::{JobId, TableRef};
use curation_plan::{QuerySpec, WriteMode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Error reasons that are worth resubmitting
pub const TRANSIENT_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "backendError",
    "internalError",
    "timeout",
    "jobRateLimitExceeded",
    "quotaExceeded",
];

/// A statement to run as a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Statement text
    pub statement: String,
    /// Output table, if any
    pub destination: Option<TableRef>,
    /// Write disposition, present only with a destination
    pub write_mode: Option<WriteMode>,
    /// Labels attached to the job
    pub labels: IndexMap<String, String>,
}

impl JobRequest {
    /// A request with no destination
    #[must_use]
    pub fn statement(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            destination: None,
            write_mode: None,
            labels: IndexMap::new(),
        }
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl From<&QuerySpec> for JobRequest {
    fn from(query: &QuerySpec) -> Self {
        Self {
            statement: query.text.clone(),
            destination: query.destination.clone(),
            write_mode: query.destination.as_ref().map(|_| query.write_mode),
            labels: IndexMap::new(),
        }
    }
}

/// Handle to a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Job identifier assigned by the warehouse
    pub job_id: JobId,
}

impl JobHandle {
    /// Wrap a job id
    #[must_use]
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.job_id.fmt(f)
    }
}

/// Terminal error reported for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorDetail {
    /// Machine-readable reason
    pub reason: String,
    /// Message from the warehouse
    pub message: String,
}

impl JobErrorDetail {
    /// Create a detail
    #[must_use]
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Whether the reason is one of [`TRANSIENT_REASONS`]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        TRANSIENT_REASONS.contains(&self.reason.as_str())
    }
}

impl std::fmt::Display for JobErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// State of a job as reported by a poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Still queued or running
    Pending,
    /// Finished without error
    Success,
    /// Finished with an error
    Error(JobErrorDetail),
}

impl JobState {
    /// Whether the job will not change state again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Failure of the client call itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("warehouse client error{}: {message}", .transient.then_some(" (transient)").unwrap_or_default())]
pub struct WarehouseError {
    /// Whether repeating the call may succeed
    pub transient: bool,
    /// Description
    pub message: String,
}

impl WarehouseError {
    /// A failure that may succeed on retry
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    /// A failure that will not succeed on retry
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

/// Warehouse job system
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Submit a job
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, WarehouseError>;

    /// Fetch the current state of a job
    async fn poll(&self, handle: &JobHandle) -> Result<JobState, WarehouseError>;

    /// Ask the warehouse to stop a job
    ///
    /// Returns an error if the job cannot be cancelled; it then keeps
    /// running to completion.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use curation_core::Coordinates;

    #[test]
    fn test_transient_classification() {
        for reason in TRANSIENT_REASONS {
            assert!(JobErrorDetail::new(*reason, "x").is_transient());
        }
        assert!(!JobErrorDetail::new("invalidQuery", "syntax").is_transient());
        assert!(!JobErrorDetail::new("notFound", "no table").is_transient());
        assert!(!JobErrorDetail::new("RATELIMITEXCEEDED", "case").is_transient());
    }

    #[test]
    fn test_request_from_query() {
        let coords = Coordinates::new("p", "d", "s").unwrap();
        let to_table = QuerySpec::to_table("SELECT 1", coords.sandbox_table("t"), WriteMode::Append);
        let request = JobRequest::from(&to_table);
        assert_eq!(request.write_mode, Some(WriteMode::Append));
        assert_eq!(request.destination, Some(coords.sandbox_table("t")));

        let bare = JobRequest::from(&QuerySpec::mutation("DELETE FROM x WHERE 1", "x"));
        assert!(bare.destination.is_none());
        assert!(bare.write_mode.is_none());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            WarehouseError::transient("reset").to_string(),
            "warehouse client error (transient): reset"
        );
        assert_eq!(
            JobErrorDetail::new("invalidQuery", "bad").to_string(),
            "invalidQuery: bad"
        );
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Error(JobErrorDetail::new("x", "y")).is_terminal());
    }
}
