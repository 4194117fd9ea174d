//! Scheduler for recurring tasks.
//!
//! Every pool runs the same loop. On each tick, each task's due occurrences
//! are derived from its cron schedule, and each occurrence is claimed through
//! `Backend::try_lock_trigger` keyed by the occurrence instant. Exactly one
//! process wins a key; the others move on. A winner that dies before
//! `complete_trigger` leaves the occurrence skipped for good.

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::error::{Result, TqError};
use crate::registry::BoxedTask;
use crate::time;
use crate::worker::panic_message;

/// Parse a cron expression.
///
/// Accepts the `cron` crate's 6/7-field syntax (seconds first). Classic
/// 5-field expressions get a `0` seconds field prepended.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| TqError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Canonical trigger key of an occurrence: its instant in whole seconds.
pub fn trigger_key(occurrence: DateTime<Utc>) -> DateTime<Utc> {
    time::from_millis(occurrence.timestamp() * 1000)
}

/// A declared recurring task.
pub(crate) struct ScheduledTask {
    pub(crate) id: String,
    pub(crate) expression: String,
    pub(crate) schedule: Schedule,
    pub(crate) execute: BoxedTask,
}

/// Context handed to a scheduled task execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    trigger_key: DateTime<Utc>,
    worker_id: String,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The occurrence being executed.
    pub fn trigger_key(&self) -> DateTime<Utc> {
        self.trigger_key
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

pub(crate) struct Scheduler {
    backend: SharedBackend,
    worker_id: String,
    tasks: Vec<Arc<ScheduledTask>>,
    /// Last occurrence evaluated per task.
    cursors: HashMap<String, DateTime<Utc>>,
    running: JoinSet<()>,
}

impl Scheduler {
    pub(crate) fn new(
        backend: SharedBackend,
        worker_id: impl Into<String>,
        tasks: Vec<Arc<ScheduledTask>>,
        start: DateTime<Utc>,
    ) -> Self {
        let cursors = tasks.iter().map(|t| (t.id.clone(), start)).collect();
        Self {
            backend,
            worker_id: worker_id.into(),
            tasks,
            cursors,
            running: JoinSet::new(),
        }
    }

    /// Tick every `interval` until `shutdown` fires, then wait for running
    /// occurrences.
    pub(crate) async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.worker_id,
            tasks = self.tasks.len(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick_at(time::now()).await;
                }
            }
        }

        self.drain().await;
        tracing::info!(worker_id = %self.worker_id, "Scheduler stopped");
    }

    /// Evaluate every task's occurrences in `(cursor, now]`.
    ///
    /// Returns the number of occurrences this scheduler won.
    pub(crate) async fn tick_at(&mut self, now: DateTime<Utc>) -> usize {
        while self.running.try_join_next().is_some() {}

        let mut won = 0;
        let tasks = self.tasks.clone();
        for task in tasks {
            let Some(mut cursor) = self.cursors.get(&task.id).copied() else {
                continue;
            };

            let due: Vec<DateTime<Utc>> = task
                .schedule
                .after(&cursor)
                .take_while(|occurrence| *occurrence <= now)
                .collect();

            for occurrence in due {
                let key = trigger_key(occurrence);
                match self
                    .backend
                    .try_lock_trigger(&task.id, key, &self.worker_id)
                    .await
                {
                    Ok(true) => {
                        tracing::debug!(
                            task_id = %task.id,
                            trigger_key = %key,
                            worker_id = %self.worker_id,
                            "Trigger won"
                        );
                        self.spawn_occurrence(task.clone(), key);
                        won += 1;
                    }
                    Ok(false) => {
                        tracing::trace!(task_id = %task.id, trigger_key = %key, "Trigger taken elsewhere");
                    }
                    Err(e) => {
                        // The cursor stays before this occurrence so the next tick retries it.
                        tracing::error!(
                            task_id = %task.id,
                            trigger_key = %key,
                            error = %e,
                            "Failed to lock trigger"
                        );
                        break;
                    }
                }
                cursor = occurrence;
            }

            self.cursors.insert(task.id.clone(), cursor);
        }
        won
    }

    fn spawn_occurrence(&mut self, task: Arc<ScheduledTask>, key: DateTime<Utc>) {
        let backend = self.backend.clone();
        let ctx = TaskContext {
            task_id: task.id.clone(),
            trigger_key: key,
            worker_id: self.worker_id.clone(),
        };

        self.running.spawn(async move {
            let worker_id = ctx.worker_id.clone();
            let outcome = AssertUnwindSafe(async { (task.execute)(ctx).await })
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.message),
                Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
            };

            match &error {
                None => tracing::debug!(task_id = %task.id, trigger_key = %key, "Scheduled task finished"),
                Some(e) => tracing::warn!(
                    task_id = %task.id,
                    trigger_key = %key,
                    expression = %task.expression,
                    error = %e,
                    "Scheduled task failed"
                ),
            }

            if let Err(e) = backend
                .complete_trigger(&task.id, key, &worker_id, error.as_deref())
                .await
            {
                tracing::error!(
                    task_id = %task.id,
                    trigger_key = %key,
                    error = %e,
                    "Failed to mark trigger executed"
                );
            }
        });
    }

    /// Wait for all running occurrences to finish.
    pub(crate) async fn drain(&mut self) {
        while let Some(result) = self.running.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Scheduled task aborted");
            }
        }
    }
}
