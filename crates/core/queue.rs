//! Queue handles, processing-function signatures and the job context.

use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::error::{Result, TqError};
use crate::job::{EnqueueOptions, JobId, JobRecord, QueueStats};
use crate::retry::RetryPolicy;

/// Result type for processing functions.
pub type JobResult<R = ()> = std::result::Result<R, JobError>;

/// Error returned from processing functions and scheduled tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Error message.
    pub message: String,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error (the job goes straight to FAILED).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Options bound to a queue at definition time.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Jobs from this queue running at once within one process.
    pub concurrency: usize,
    /// Attempt ceiling, unless overridden per job.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Per-attempt execution timeout. An overrun counts as a retryable failure.
    pub timeout: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self, queue: &str) -> Result<()> {
        if self.concurrency == 0 {
            return Err(TqError::Config(format!(
                "queue '{}': concurrency must be at least 1",
                queue
            )));
        }
        if self.max_attempts == 0 {
            return Err(TqError::Config(format!(
                "queue '{}': max_attempts must be at least 1",
                queue
            )));
        }
        Ok(())
    }
}

/// Execution context handed to a processing function.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    queue: String,
    attempt: u32,
    worker_id: String,
    backend: SharedBackend,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job: &JobRecord,
        worker_id: impl Into<String>,
        backend: SharedBackend,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
            attempt: job.attempts,
            worker_id: worker_id.into(),
            backend,
            cancel,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Record progress for polling callers.
    ///
    /// Fails with `Config` for values above 100 and with `ClaimLost` if this
    /// worker no longer holds the job.
    pub async fn set_progress(&self, progress: u8) -> Result<()> {
        if progress > 100 {
            return Err(TqError::Config(format!(
                "progress must be within 0..=100, got {}",
                progress
            )));
        }
        self.backend
            .update_progress(&self.job_id, &self.worker_id, progress)
            .await
    }

    /// Fires when the worker stops waiting for this job during shutdown.
    ///
    /// Checking it is up to the processing function.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Typed producer handle for one queue.
pub struct Queue<T> {
    name: String,
    max_attempts: u32,
    backend: SharedBackend,
    _payload: PhantomData<fn(T)>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            max_attempts: self.max_attempts,
            backend: self.backend.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl<T: Serialize> Queue<T> {
    pub(crate) fn new(name: impl Into<String>, max_attempts: u32, backend: SharedBackend) -> Self {
        Self {
            name: name.into(),
            max_attempts,
            backend,
            _payload: PhantomData,
        }
    }

    /// Producer-only handle for processes that enqueue without processing.
    ///
    /// Jobs get the default attempt ceiling unless `max_attempts` is set.
    pub fn producer(backend: SharedBackend, name: impl Into<String>) -> Self {
        Self::new(name, QueueOptions::default().max_attempts, backend)
    }

    /// Override the attempt ceiling for jobs added through this handle.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Returns once the record is durable.
    pub async fn add(&self, data: &T) -> Result<JobId> {
        self.add_with_options(data, EnqueueOptions::default()).await
    }

    /// Enqueue a job with a delay or attempt override.
    pub async fn add_with_options(&self, data: &T, options: EnqueueOptions) -> Result<JobId> {
        let max_attempts = options.max_attempts.unwrap_or(self.max_attempts);
        if max_attempts == 0 {
            return Err(TqError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let payload = serde_json::to_value(data)?;
        let job = JobRecord::new(&self.name, payload, max_attempts, options.delay);
        self.backend.enqueue(&job).await?;

        tracing::debug!(
            job_id = %job.id,
            queue = %self.name,
            available_at = %job.available_at,
            "Job enqueued"
        );
        Ok(job.id)
    }

    /// Cancel a pending or retrying job.
    ///
    /// Returns `false` if the job is already running or settled. Unknown ids
    /// fail with `JobNotFound`.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool> {
        match self.backend.cancel(job_id).await {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, queue = %self.name, "Job cancelled");
                Ok(true)
            }
            Err(TqError::InvalidState { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read-only snapshot of a job.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        self.backend.get_job(job_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.backend.queue_stats(&self.name).await
    }
}
