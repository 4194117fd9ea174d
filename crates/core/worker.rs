//! Worker loop: one task per queue concurrency slot.

use futures_util::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::error::TqError;
use crate::job::{JobRecord, Settlement};
use crate::queue::{JobContext, JobError};
use crate::registry::QueueEntry;
use crate::time;

/// Attempts made to record an outcome before giving up on a backend error.
const SETTLE_ATTEMPTS: u32 = 3;

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bounded exponential poll backoff with random jitter.
#[derive(Debug, Clone)]
pub(crate) struct PollBackoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    current: Duration,
}

impl PollBackoff {
    pub(crate) fn new(min: Duration, max: Duration, jitter: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            jitter,
            current: min,
        }
    }

    /// Delay for the next idle poll; doubles the following one.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);

        if self.jitter.is_zero() {
            return delay;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        delay + Duration::from_millis(random_jitter)
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.min;
    }
}

/// One concurrency slot of one queue.
pub(crate) struct Worker {
    pub(crate) slot: usize,
    pub(crate) worker_id: String,
    pub(crate) queue: Arc<QueueEntry>,
    pub(crate) backend: SharedBackend,
    pub(crate) backoff: PollBackoff,
    /// Stops claiming and wakes idle sleeps.
    pub(crate) shutdown: CancellationToken,
    /// Parent of every job's cancellation token.
    pub(crate) abort: CancellationToken,
    pub(crate) in_progress: Arc<AtomicUsize>,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        tracing::debug!(
            worker_id = %self.worker_id,
            queue = %self.queue.name,
            slot = self.slot,
            "Worker started"
        );

        let queues = vec![self.queue.name.clone()];
        while !self.shutdown.is_cancelled() {
            match self.backend.claim_next(&queues, &self.worker_id).await {
                Ok(Some(job)) => {
                    self.backoff.reset();
                    self.in_progress.fetch_add(1, Ordering::SeqCst);
                    self.process(job).await;
                    self.in_progress.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(None) => {
                    let delay = self.backoff.next_delay();
                    tracing::trace!(queue = %self.queue.name, ?delay, "No claimable job");
                    self.idle(delay).await;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::error!(
                        worker_id = %self.worker_id,
                        queue = %self.queue.name,
                        error = %e,
                        ?delay,
                        "Failed to claim job"
                    );
                    self.idle(delay).await;
                }
            }
        }

        tracing::debug!(
            worker_id = %self.worker_id,
            queue = %self.queue.name,
            slot = self.slot,
            "Worker stopped"
        );
    }

    async fn idle(&self, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Execute one claimed job and record its outcome.
    pub(crate) async fn process(&self, job: JobRecord) {
        tracing::debug!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            queue = %job.queue_name,
            attempt = job.attempts,
            "Processing job"
        );

        let ctx = JobContext::new(
            &job,
            self.worker_id.clone(),
            self.backend.clone(),
            self.abort.child_token(),
        );
        let handler = self.queue.handler.clone();
        let data = job.data.clone();
        let execution = AssertUnwindSafe(async move { handler(data, ctx).await }).catch_unwind();

        let outcome = match self.queue.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(JobError::retryable(format!(
                    "timed out after {:?}",
                    limit
                )))),
            },
            None => execution.await,
        };

        let settlement = match outcome {
            Ok(Ok(result)) => Settlement::Completed { result },
            Ok(Err(err)) => {
                self.queue
                    .options
                    .retry
                    .decide(&job, err.message, err.retryable, time::now())
            }
            Err(panic) => self.queue.options.retry.decide(
                &job,
                format!("panicked: {}", panic_message(&*panic)),
                true,
                time::now(),
            ),
        };

        self.settle(&job, settlement).await;
    }

    async fn settle(&self, job: &JobRecord, settlement: Settlement) {
        match &settlement {
            Settlement::Completed { .. } => {
                tracing::debug!(job_id = %job.id, queue = %job.queue_name, "Job completed");
            }
            Settlement::Retry {
                error,
                available_at,
            } => {
                tracing::debug!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    attempts = job.attempts,
                    %available_at,
                    error = %error,
                    "Job scheduled for retry"
                );
            }
            Settlement::Failed { error } => {
                tracing::warn!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %error,
                    "Job failed"
                );
            }
        }

        let mut backoff = self.backoff.clone();
        backoff.reset();
        for attempt in 1..=SETTLE_ATTEMPTS {
            match self
                .backend
                .settle(&job.id, &self.worker_id, settlement.clone())
                .await
            {
                Ok(()) => return,
                Err(e @ TqError::ClaimLost { .. }) => {
                    tracing::error!(
                        worker_id = %self.worker_id,
                        job_id = %job.id,
                        queue = %job.queue_name,
                        error = %e,
                        "Lost claim on job before settling; it may have run twice"
                    );
                    return;
                }
                Err(e) if e.is_transient() && attempt < SETTLE_ATTEMPTS => {
                    tracing::warn!(job_id = %job.id, attempt, error = %e, "Failed to settle job, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to settle job");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::memory::MemoryBackend;
    use crate::queue::QueueOptions;
    use crate::registry::Registry;
    use crate::retry::RetryPolicy;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    fn worker_for(registry: &Registry, queue: usize) -> Worker {
        Worker {
            slot: 0,
            worker_id: "test-worker".to_string(),
            queue: registry.queues()[queue].clone(),
            backend: registry.backend().clone(),
            backoff: PollBackoff::new(Duration::from_millis(1), Duration::from_millis(5), Duration::ZERO),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            in_progress: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn claim(registry: &Registry, queue: &str) -> JobRecord {
        registry
            .backend()
            .claim_next(&[queue.to_string()], "test-worker")
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = PollBackoff::new(
            Duration::from_millis(50),
            Duration::from_millis(300),
            Duration::ZERO,
        );
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let mut backoff = PollBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(5),
        );
        for _ in 0..50 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_process_success_stores_result() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        let q = reg
            .define_queue("orders", QueueOptions::default(), |order: Order, ctx| async move {
                ctx.set_progress(50).await?;
                Ok(order.id * 2)
            })
            .unwrap();
        let id = q.add(&Order { id: 21 }).await.unwrap();

        let worker = worker_for(&reg, 0);
        worker.process(claim(&reg, "orders").await).await;

        let job = q.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(serde_json::json!(42)));
        assert_eq!(job.progress, 50);
        assert!(job.settled_at.is_some());
    }

    #[tokio::test]
    async fn test_process_failure_schedules_retry() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        let q = reg
            .define_queue(
                "orders",
                QueueOptions::default()
                    .max_attempts(2)
                    .retry(RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60))),
                |_: Order, _| async { Err::<(), _>(JobError::retryable("payment gateway down")) },
            )
            .unwrap();
        let id = q.add(&Order { id: 1 }).await.unwrap();

        let worker = worker_for(&reg, 0);
        worker.process(claim(&reg, "orders").await).await;

        let job = q.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("payment gateway down"));
        assert!(job.available_at > job.created_at);
        assert!(job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_process_fatal_error_fails_immediately() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        let q = reg
            .define_queue(
                "orders",
                QueueOptions::default().max_attempts(5),
                |_: Order, _| async { Err::<(), _>(JobError::fatal("unknown sku")) },
            )
            .unwrap();
        let id = q.add(&Order { id: 1 }).await.unwrap();

        worker_for(&reg, 0).process(claim(&reg, "orders").await).await;

        let job = q.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("unknown sku"));
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_process_invalid_payload_fails() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        reg.define_queue("orders", QueueOptions::default(), |_: Order, _| async { Ok(()) })
            .unwrap();
        let raw = crate::queue::Queue::<serde_json::Value>::producer(reg.backend().clone(), "orders");
        let id = raw.add(&serde_json::json!("not an order")).await.unwrap();

        worker_for(&reg, 0).process(claim(&reg, "orders").await).await;

        let job = raw.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().starts_with("invalid payload"));
    }

    #[tokio::test]
    async fn test_process_panic_is_retryable() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        let q = reg
            .define_queue("orders", QueueOptions::default(), |_: Order, _| async {
                if true {
                    panic!("index out of bounds");
                }
                Ok(())
            })
            .unwrap();
        let id = q.add(&Order { id: 1 }).await.unwrap();

        worker_for(&reg, 0).process(claim(&reg, "orders").await).await;

        let job = q.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert!(job.last_error.unwrap().contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_process_timeout_is_retryable() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        let q = reg
            .define_queue(
                "orders",
                QueueOptions::default().timeout(Duration::from_millis(20)),
                |_: Order, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
            )
            .unwrap();
        let id = q.add(&Order { id: 1 }).await.unwrap();

        worker_for(&reg, 0).process(claim(&reg, "orders").await).await;

        let job = q.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert!(job.last_error.unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut reg = Registry::new(SharedBackend::new(MemoryBackend::new()));
        let q = reg
            .define_queue("orders", QueueOptions::default(), |_: Order, _| async { Ok(()) })
            .unwrap();
        for id in 0..10 {
            q.add(&Order { id }).await.unwrap();
        }

        let worker = worker_for(&reg, 0);
        let shutdown = worker.shutdown.clone();
        let handle = tokio::spawn(worker.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while q.stats().await.unwrap().completed < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
    }
}
