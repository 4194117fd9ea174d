//! Backend abstraction for job and trigger storage.
//!
//! Every backend (table-backed or broker-backed) implements the same
//! contract. All coordination between worker processes happens through the
//! atomic conditional writes behind `claim_next`, `settle` and
//! `try_lock_trigger`; no other shared state exists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{JobId, JobRecord, QueueStats, Settlement, TriggerRecord};

/// Backend trait for job queue storage operations.
///
/// Implementations must be thread-safe (Send + Sync). Namespacing is a
/// property of the backend instance: table and key names are prefixed with
/// the namespace given at construction.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Jobs ==========

    /// Persist a new `PENDING` record. Durable before returning `Ok`.
    async fn enqueue(&self, job: &JobRecord) -> Result<()>;

    /// Atomically claim one eligible job from any of `queues`.
    ///
    /// Eligible means `PENDING` or `RETRYING` with `available_at <= now`.
    /// The claimed job is moved to `RUNNING`, stamped with `claimed_by` and
    /// `started_at`, and its `attempts` counter is incremented. Two concurrent
    /// callers never receive the same job.
    async fn claim_next(&self, queues: &[String], worker_id: &str) -> Result<Option<JobRecord>>;

    /// Settle a `RUNNING` job held by `worker_id`.
    ///
    /// Fails with `ClaimLost` if the job is not `RUNNING` under that worker
    /// and with `JobNotFound` if it does not exist.
    async fn settle(&self, job_id: &JobId, worker_id: &str, outcome: Settlement) -> Result<()>;

    /// Record progress (0..=100) for a `RUNNING` job held by `worker_id`.
    async fn update_progress(&self, job_id: &JobId, worker_id: &str, progress: u8) -> Result<()>;

    /// Move a `PENDING`/`RETRYING` job to `CANCELLED`.
    ///
    /// Fails with `InvalidState` for running or terminal jobs.
    async fn cancel(&self, job_id: &JobId) -> Result<()>;

    /// Snapshot of a job.
    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>>;

    /// Per-state counts for one queue.
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    // ========== Liveness ==========

    /// Return `RUNNING` jobs started before `started_before` to `RETRYING`,
    /// claimable immediately. The interrupted attempt stays counted.
    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Return every `RUNNING` job held by `worker_id` to `RETRYING` without
    /// charging the interrupted attempt. Used on graceful shutdown.
    async fn release_claims(&self, worker_id: &str) -> Result<Vec<JobId>>;

    // ========== Triggers ==========

    /// Insert-or-claim the trigger row for one occurrence.
    ///
    /// Returns `true` exactly once per `(task_id, trigger_key)` across all
    /// callers.
    async fn try_lock_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<bool>;

    /// Stamp `executed_at` (and the failure text, if any) on a trigger locked
    /// by `worker_id`. Fails with `TriggerLost` otherwise.
    async fn complete_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
        error: Option<&str>,
    ) -> Result<()>;

    /// Snapshot of one trigger row.
    async fn get_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
    ) -> Result<Option<TriggerRecord>>;

    /// Delete trigger rows whose key is older than `before`.
    ///
    /// Returns the number of rows removed.
    async fn purge_triggers(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Wrap an existing shared backend.
    pub fn from_arc(inner: DynBackend) -> Self {
        Self { inner }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn enqueue(&self, job: &JobRecord) -> Result<()> {
        self.inner.enqueue(job).await
    }

    async fn claim_next(&self, queues: &[String], worker_id: &str) -> Result<Option<JobRecord>> {
        self.inner.claim_next(queues, worker_id).await
    }

    async fn settle(&self, job_id: &JobId, worker_id: &str, outcome: Settlement) -> Result<()> {
        self.inner.settle(job_id, worker_id, outcome).await
    }

    async fn update_progress(&self, job_id: &JobId, worker_id: &str, progress: u8) -> Result<()> {
        self.inner.update_progress(job_id, worker_id, progress).await
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        self.inner.cancel(job_id).await
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        self.inner.get_job(job_id).await
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.inner.queue_stats(queue).await
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<JobId>> {
        self.inner.reclaim_stale(started_before).await
    }

    async fn release_claims(&self, worker_id: &str) -> Result<Vec<JobId>> {
        self.inner.release_claims(worker_id).await
    }

    async fn try_lock_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<bool> {
        self.inner
            .try_lock_trigger(task_id, trigger_key, worker_id)
            .await
    }

    async fn complete_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
        error: Option<&str>,
    ) -> Result<()> {
        self.inner
            .complete_trigger(task_id, trigger_key, worker_id, error)
            .await
    }

    async fn get_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
    ) -> Result<Option<TriggerRecord>> {
        self.inner.get_trigger(task_id, trigger_key).await
    }

    async fn purge_triggers(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_triggers(before).await
    }
}
