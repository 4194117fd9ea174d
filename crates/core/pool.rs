//! Worker pool: the per-process runtime.

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::error::{Result, TqError};
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::time;
use crate::worker::{PollBackoff, Worker};

/// Generate a worker id of the form `{hostname}-{pid}-{8 hex chars}`.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{}-{:08x}", host, pid, suffix)
}

/// Builder for WorkerPool.
#[derive(Default)]
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    registry: Option<Registry>,
}

impl WorkerPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry of queues and tasks this pool runs.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a fixed worker id.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = Some(worker_id.into());
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the WorkerPool.
    pub fn build(self) -> Result<WorkerPool> {
        let registry = self
            .registry
            .ok_or_else(|| TqError::Config("Registry is required".to_string()))?;

        if registry.is_empty() {
            return Err(TqError::Config(
                "Registry defines no queues and no scheduled tasks".to_string(),
            ));
        }
        if self.config.poll_interval.is_zero() {
            return Err(TqError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }

        Ok(WorkerPool::new(self.config, registry))
    }
}

/// Worker pool for processing jobs and scheduled tasks.
pub struct WorkerPool {
    config: WorkerConfig,
    registry: Registry,
    worker_id: String,
    in_progress: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    fn new(config: WorkerConfig, registry: Registry) -> Self {
        let worker_id = config.worker_id.clone().unwrap_or_else(generate_worker_id);
        Self {
            config,
            registry,
            worker_id,
            in_progress: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Identity stamped into claims and trigger locks.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of jobs currently executing in this pool.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run the worker pool until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the worker pool until the provided shutdown future completes.
    ///
    /// On shutdown, claiming stops and in-flight jobs get `shutdown_timeout`
    /// to finish. Past that, job cancellation tokens fire, the remaining
    /// executions are aborted and their jobs are released back to `RETRYING`.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let backend = self.registry.backend().clone();
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Spawn scheduler
        let scheduled = self.registry.tasks().to_vec();
        if self.config.enable_scheduler && !scheduled.is_empty() {
            let scheduler = Scheduler::new(
                backend.clone(),
                self.worker_id.clone(),
                scheduled,
                time::now(),
            );
            let interval = self.config.scheduler_interval;
            let stop = stop.clone();
            tasks.spawn(async move { scheduler.run(interval, stop).await });
        }

        // Spawn reaper (if enabled)
        if self.config.enable_reaper {
            let reaper = Reaper::new(
                backend.clone(),
                self.config.reaper_interval,
                self.config.stale_threshold,
                self.config.trigger_retention,
            );
            let stop = stop.clone();
            tasks.spawn(async move { reaper.run(stop).await });
        }

        // Spawn one worker per queue concurrency slot
        let mut slots = 0;
        for queue in self.registry.queues() {
            for slot in 0..queue.options.concurrency {
                let worker = Worker {
                    slot,
                    worker_id: self.worker_id.clone(),
                    queue: queue.clone(),
                    backend: backend.clone(),
                    backoff: PollBackoff::new(
                        self.config.poll_interval,
                        self.config.max_poll_interval,
                        self.config.poll_jitter,
                    ),
                    shutdown: stop.clone(),
                    abort: abort.clone(),
                    in_progress: self.in_progress.clone(),
                };
                tasks.spawn(worker.run());
                slots += 1;
            }
        }

        tracing::info!(
            worker_id = %self.worker_id,
            queues = ?self.registry.queue_names(),
            tasks = ?self.registry.task_ids(),
            slots,
            "Worker pool started"
        );

        // Wait for shutdown signal/future
        shutdown.await;
        tracing::info!(worker_id = %self.worker_id, "Shutdown requested, draining...");
        stop.cancel();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Task panicked");
                }
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!(worker_id = %self.worker_id, "Worker pool stopped");
            return Ok(());
        }

        tracing::warn!(
            worker_id = %self.worker_id,
            in_progress = self.in_progress_count(),
            timeout = ?self.config.shutdown_timeout,
            "Shutdown timeout reached, forcing stop"
        );
        abort.cancel();
        tasks.shutdown().await;

        let released = backend.release_claims(&self.worker_id).await?;
        self.in_progress.store(0, Ordering::SeqCst);
        if !released.is_empty() {
            tracing::info!(
                worker_id = %self.worker_id,
                count = released.len(),
                "Released unfinished jobs back to RETRYING"
            );
        }

        tracing::info!(worker_id = %self.worker_id, "Worker pool stopped");
        Ok(())
    }
}
