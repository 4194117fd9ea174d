//! Process-local backend.
//!
//! Implements the full contract behind a single mutex. Only useful when every
//! worker lives in the same process (tests, single-binary deployments).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::backend::Backend;
use crate::error::{Result, TqError};
use crate::job::{JobId, JobRecord, JobState, QueueStats, Settlement, TriggerRecord};
use crate::time;

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Jobs keyed by id, with their enqueue sequence for FIFO claims.
    jobs: HashMap<JobId, (u64, JobRecord)>,
    triggers: HashMap<(String, DateTime<Utc>), TriggerRecord>,
}

/// In-memory `Backend`.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs, in any state.
    pub fn job_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}

fn claim_lost(job_id: &JobId, worker_id: &str) -> TqError {
    TqError::ClaimLost {
        job_id: job_id.to_string(),
        worker_id: worker_id.to_string(),
    }
}

/// Look up a job that is `RUNNING` under `worker_id`.
fn held_job<'a>(
    jobs: &'a mut HashMap<JobId, (u64, JobRecord)>,
    job_id: &JobId,
    worker_id: &str,
) -> Result<&'a mut JobRecord> {
    let (_, job) = jobs
        .get_mut(job_id)
        .ok_or_else(|| TqError::JobNotFound(job_id.to_string()))?;
    if job.state != JobState::Running || job.claimed_by.as_deref() != Some(worker_id) {
        return Err(claim_lost(job_id, worker_id));
    }
    Ok(job)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn enqueue(&self, job: &JobRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(TqError::Backend(format!("Job {} already exists", job.id)));
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.jobs.insert(job.id.clone(), (seq, job.clone()));
        Ok(())
    }

    async fn claim_next(&self, queues: &[String], worker_id: &str) -> Result<Option<JobRecord>> {
        let now = time::now();
        let mut inner = self.inner.lock();

        let next = inner
            .jobs
            .iter()
            .filter(|(_, (_, job))| {
                job.is_claimable_at(now) && queues.iter().any(|q| *q == job.queue_name)
            })
            .min_by_key(|(_, (seq, _))| *seq)
            .map(|(id, _)| id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some((_, job)) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.state = JobState::Running;
        job.claimed_by = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn settle(&self, job_id: &JobId, worker_id: &str, outcome: Settlement) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = held_job(&mut inner.jobs, job_id, worker_id)?;
        outcome.apply(job, time::now());
        Ok(())
    }

    async fn update_progress(&self, job_id: &JobId, worker_id: &str, progress: u8) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = held_job(&mut inner.jobs, job_id, worker_id)?;
        job.progress = progress.min(100);
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock();
        let (_, job) = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| TqError::JobNotFound(job_id.to_string()))?;

        if !job.state.is_cancellable() {
            return Err(TqError::InvalidState {
                job_id: job_id.to_string(),
                state: job.state,
                operation: "cancel",
            });
        }
        job.state = JobState::Cancelled;
        job.settled_at = Some(time::now());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self
            .inner
            .lock()
            .jobs
            .get(job_id)
            .map(|(_, job)| job.clone()))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for (_, job) in inner.jobs.values() {
            if job.queue_name == queue {
                stats.add(job.state, 1);
            }
        }
        Ok(stats)
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<JobId>> {
        let now = time::now();
        let mut inner = self.inner.lock();
        let mut reclaimed = Vec::new();

        for (_, job) in inner.jobs.values_mut() {
            let stale = job.state == JobState::Running
                && job.started_at.is_some_and(|t| t < started_before);
            if stale {
                job.state = JobState::Retrying;
                job.claimed_by = None;
                job.available_at = now;
                reclaimed.push(job.id.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn release_claims(&self, worker_id: &str) -> Result<Vec<JobId>> {
        let now = time::now();
        let mut inner = self.inner.lock();
        let mut released = Vec::new();

        for (_, job) in inner.jobs.values_mut() {
            if job.state == JobState::Running && job.claimed_by.as_deref() == Some(worker_id) {
                job.state = JobState::Retrying;
                job.claimed_by = None;
                job.available_at = now;
                job.attempts = job.attempts.saturating_sub(1);
                released.push(job.id.clone());
            }
        }
        Ok(released)
    }

    async fn try_lock_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let row = inner
            .triggers
            .entry((task_id.to_string(), trigger_key))
            .or_insert_with(|| TriggerRecord {
                task_id: task_id.to_string(),
                trigger_key,
                locked_by: None,
                locked_at: None,
                executed_at: None,
                error: None,
            });

        if row.locked_by.is_some() {
            return Ok(false);
        }
        row.locked_by = Some(worker_id.to_string());
        row.locked_at = Some(time::now());
        Ok(true)
    }

    async fn complete_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .triggers
            .get_mut(&(task_id.to_string(), trigger_key))
            .filter(|row| row.locked_by.as_deref() == Some(worker_id))
            .ok_or_else(|| TqError::TriggerLost {
                task_id: task_id.to_string(),
                trigger_key: time::to_millis(trigger_key),
                worker_id: worker_id.to_string(),
            })?;

        row.executed_at = Some(time::now());
        row.error = error.map(str::to_string);
        Ok(())
    }

    async fn get_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
    ) -> Result<Option<TriggerRecord>> {
        Ok(self
            .inner
            .lock()
            .triggers
            .get(&(task_id.to_string(), trigger_key))
            .cloned())
    }

    async fn purge_triggers(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let len = inner.triggers.len();
        inner.triggers.retain(|(_, key), _| *key >= before);
        Ok((len - inner.triggers.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn enqueue(backend: &MemoryBackend, queue: &str) -> JobId {
        let job = JobRecord::new(queue, serde_json::json!({"n": 1}), 3, None);
        backend.enqueue(&job).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_keeps_running_claim() {
        let backend = MemoryBackend::new();
        let job = JobRecord::new("email", serde_json::json!({"n": 1}), 3, None);
        backend.enqueue(&job).await.unwrap();
        backend
            .claim_next(&queues(&["email"]), "w1")
            .await
            .unwrap()
            .unwrap();

        let err = backend.enqueue(&job).await.unwrap_err();
        assert!(matches!(err, TqError::Backend(_)));

        let stored = backend.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(stored.claimed_by.as_deref(), Some("w1"));
        assert!(backend
            .claim_next(&queues(&["email"]), "w2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_stamps_worker_and_attempts() {
        let backend = MemoryBackend::new();
        let id = enqueue(&backend, "email").await;

        let job = backend
            .claim_next(&queues(&["email"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.claimed_by.as_deref(), Some("w1"));
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        assert!(backend
            .claim_next(&queues(&["email"]), "w2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_filters_queue() {
        let backend = MemoryBackend::new();
        let first = enqueue(&backend, "email").await;
        let _other = enqueue(&backend, "search").await;
        let second = enqueue(&backend, "email").await;

        let q = queues(&["email"]);
        assert_eq!(backend.claim_next(&q, "w").await.unwrap().unwrap().id, first);
        assert_eq!(backend.claim_next(&q, "w").await.unwrap().unwrap().id, second);
        assert!(backend.claim_next(&q, "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_early() {
        let backend = MemoryBackend::new();
        let job = JobRecord::new("email", serde_json::Value::Null, 3, Some(Duration::from_secs(60)));
        backend.enqueue(&job).await.unwrap();

        assert!(backend
            .claim_next(&queues(&["email"]), "w")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_settle_requires_claim() {
        let backend = MemoryBackend::new();
        let id = enqueue(&backend, "email").await;
        backend.claim_next(&queues(&["email"]), "w1").await.unwrap();

        let err = backend
            .settle(&id, "w2", Settlement::Completed { result: None })
            .await
            .unwrap_err();
        assert!(matches!(err, TqError::ClaimLost { .. }));

        backend
            .settle(&id, "w1", Settlement::Completed { result: None })
            .await
            .unwrap();

        // A second settle by the same worker must fail loudly too.
        let err = backend
            .settle(&id, "w1", Settlement::Completed { result: None })
            .await
            .unwrap_err();
        assert!(matches!(err, TqError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_settle_unknown_job() {
        let backend = MemoryBackend::new();
        let err = backend
            .settle(&JobId::new(), "w", Settlement::Completed { result: None })
            .await
            .unwrap_err();
        assert!(matches!(err, TqError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_progress() {
        let backend = MemoryBackend::new();
        let id = enqueue(&backend, "email").await;
        backend.claim_next(&queues(&["email"]), "w1").await.unwrap();

        backend.update_progress(&id, "w1", 40).await.unwrap();
        assert_eq!(backend.get_job(&id).await.unwrap().unwrap().progress, 40);

        let err = backend.update_progress(&id, "w2", 50).await.unwrap_err();
        assert!(matches!(err, TqError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let backend = MemoryBackend::new();
        let pending = enqueue(&backend, "email").await;
        backend.cancel(&pending).await.unwrap();
        assert_eq!(
            backend.get_job(&pending).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
        assert!(backend
            .claim_next(&queues(&["email"]), "w")
            .await
            .unwrap()
            .is_none());

        let running = enqueue(&backend, "email").await;
        backend.claim_next(&queues(&["email"]), "w").await.unwrap();
        let err = backend.cancel(&running).await.unwrap_err();
        assert!(matches!(
            err,
            TqError::InvalidState {
                state: JobState::Running,
                ..
            }
        ));

        let err = backend.cancel(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, TqError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_release_claims_does_not_charge_attempt() {
        let backend = MemoryBackend::new();
        let id = enqueue(&backend, "email").await;
        backend.claim_next(&queues(&["email"]), "w1").await.unwrap();

        let released = backend.release_claims("w1").await.unwrap();
        assert_eq!(released, vec![id.clone()]);

        let job = backend.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.attempts, 0);
        assert!(job.claimed_by.is_none());

        let again = backend
            .claim_next(&queues(&["email"]), "w2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_reclaim_stale() {
        let backend = MemoryBackend::new();
        let id = enqueue(&backend, "email").await;
        backend.claim_next(&queues(&["email"]), "w1").await.unwrap();

        let not_yet = backend
            .reclaim_stale(time::now() - ChronoDuration::minutes(30))
            .await
            .unwrap();
        assert!(not_yet.is_empty());

        let reclaimed = backend
            .reclaim_stale(time::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![id.clone()]);

        let job = backend.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.attempts, 1);

        // The old holder has lost its claim.
        let err = backend
            .settle(&id, "w1", Settlement::Completed { result: None })
            .await
            .unwrap_err();
        assert!(matches!(err, TqError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_trigger_lock_once() {
        let backend = MemoryBackend::new();
        let key = time::from_millis(1_700_000_000_000);

        assert!(backend.try_lock_trigger("reindex", key, "w1").await.unwrap());
        assert!(!backend.try_lock_trigger("reindex", key, "w2").await.unwrap());
        assert!(!backend.try_lock_trigger("reindex", key, "w1").await.unwrap());
        assert!(backend
            .try_lock_trigger("reindex", key + ChronoDuration::seconds(5), "w2")
            .await
            .unwrap());
        assert!(backend.try_lock_trigger("other", key, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_trigger() {
        let backend = MemoryBackend::new();
        let key = time::from_millis(1_700_000_000_000);
        backend.try_lock_trigger("reindex", key, "w1").await.unwrap();

        let err = backend
            .complete_trigger("reindex", key, "w2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TqError::TriggerLost { .. }));

        backend
            .complete_trigger("reindex", key, "w1", Some("boom"))
            .await
            .unwrap();
        let row = backend.get_trigger("reindex", key).await.unwrap().unwrap();
        assert_eq!(row.locked_by.as_deref(), Some("w1"));
        assert!(row.executed_at.is_some());
        assert_eq!(row.error.as_deref(), Some("boom"));

        // An executed occurrence is never claimed again.
        assert!(!backend.try_lock_trigger("reindex", key, "w3").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_triggers() {
        let backend = MemoryBackend::new();
        let old = time::from_millis(1_000);
        let new = time::from_millis(10_000);
        backend.try_lock_trigger("t", old, "w").await.unwrap();
        backend.try_lock_trigger("t", new, "w").await.unwrap();

        assert_eq!(backend.purge_triggers(time::from_millis(5_000)).await.unwrap(), 1);
        assert!(backend.get_trigger("t", old).await.unwrap().is_none());
        assert!(backend.get_trigger("t", new).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let backend = MemoryBackend::new();
        let a = enqueue(&backend, "email").await;
        enqueue(&backend, "email").await;
        enqueue(&backend, "search").await;
        backend.cancel(&a).await.unwrap();

        let stats = backend.queue_stats("email").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let backend = Arc::new(MemoryBackend::new());
        for _ in 0..200 {
            enqueue(&backend, "bulk").await;
        }

        let mut handles = Vec::new();
        for w in 0..5 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("w{}", w);
                let q = vec!["bulk".to_string()];
                let mut claimed = Vec::new();
                while let Some(job) = backend.claim_next(&q, &worker).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }
}
