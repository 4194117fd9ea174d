//! Error types for the tq job queue library.

use thiserror::Error;

use crate::job::JobState;

/// The main error type for the tq library.
#[derive(Error, Debug)]
pub enum TqError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store or connectivity error reported by a backend.
    ///
    /// Callers treat this as retryable at the operation level.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is not in a state that allows the requested operation.
    #[error("Cannot {operation} job {job_id} in state {state}")]
    InvalidState {
        job_id: String,
        state: JobState,
        operation: &'static str,
    },

    /// The job is no longer `RUNNING` under this worker's claim.
    ///
    /// Raised by `settle` and `update_progress`. This points at a possible
    /// double execution, not an ordinary job failure.
    #[error("Claim lost: job {job_id} is no longer running under worker {worker_id}")]
    ClaimLost { job_id: String, worker_id: String },

    /// The trigger occurrence is not locked by this worker.
    #[error("Trigger {task_id}@{trigger_key} is not locked by worker {worker_id}")]
    TriggerLost {
        task_id: String,
        trigger_key: i64,
        worker_id: String,
    },

    /// A processing function is already bound to this queue name.
    #[error("Queue already defined: {0}")]
    DuplicateQueue(String),

    /// A scheduled task with this id is already declared.
    #[error("Scheduled task already defined: {0}")]
    DuplicateTask(String),

    /// Malformed cron expression.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored record could not be decoded. Retrying will not help.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl TqError {
    /// Whether the failed operation may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, TqError::Backend(_))
    }
}

/// Result type alias using TqError.
pub type Result<T> = std::result::Result<T, TqError>;
