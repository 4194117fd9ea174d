//! Reaper component for stale job recovery.
//!
//! A worker that crashes mid-execution never settles its job. The reaper
//! periodically returns `RUNNING` jobs whose `started_at` is older than the
//! stale threshold to `RETRYING`, and purges old trigger rows. Locked but
//! unexecuted triggers are never reclaimed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SharedBackend};
use crate::error::Result;
use crate::time;

/// Outcome of one reaper sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub purged_triggers: u64,
}

/// Reaper that recovers jobs from dead workers.
pub struct Reaper {
    backend: SharedBackend,
    interval: Duration,
    stale_threshold: Duration,
    trigger_retention: Duration,
}

impl Reaper {
    /// Create a new reaper.
    pub fn new(
        backend: SharedBackend,
        interval: Duration,
        stale_threshold: Duration,
        trigger_retention: Duration,
    ) -> Self {
        Self {
            backend,
            interval,
            stale_threshold,
            trigger_retention,
        }
    }

    /// Run the reaper loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::debug!("Reaper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_at(time::now()).await {
                        tracing::error!(error = %e, "Reaper sweep failed");
                    }
                }
            }
        }

        tracing::debug!("Reaper stopped");
    }

    /// Run one sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let stale_before = cutoff(now, self.stale_threshold);
        let reclaimed = self.backend.reclaim_stale(stale_before).await?;
        if !reclaimed.is_empty() {
            tracing::info!(
                count = reclaimed.len(),
                stale_before = %stale_before,
                "Reclaimed stale running jobs"
            );
            for job_id in &reclaimed {
                tracing::debug!(job_id = %job_id, "Job returned to RETRYING");
            }
        }

        let purged_triggers = self
            .backend
            .purge_triggers(cutoff(now, self.trigger_retention))
            .await?;
        if purged_triggers > 0 {
            tracing::debug!(count = purged_triggers, "Purged old trigger rows");
        }

        Ok(SweepReport {
            reclaimed: reclaimed.len(),
            purged_triggers,
        })
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRecord, JobState};
    use crate::memory::MemoryBackend;

    #[tokio::test]
    async fn test_sweep_reclaims_stale_and_purges_triggers() {
        let backend = SharedBackend::new(MemoryBackend::new());
        let job = JobRecord::new("email", serde_json::Value::Null, 3, None);
        backend.enqueue(&job).await.unwrap();
        backend
            .claim_next(&["email".to_string()], "dead-worker")
            .await
            .unwrap();

        let old_key = time::now() - ChronoDuration::days(8);
        let fresh_key = time::now() - ChronoDuration::hours(1);
        backend.try_lock_trigger("t", old_key, "w").await.unwrap();
        backend.try_lock_trigger("t", fresh_key, "w").await.unwrap();

        let reaper = Reaper::new(
            backend.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30 * 60),
            Duration::from_secs(7 * 24 * 3600),
        );

        // Nothing is stale yet.
        let report = reaper.sweep_at(time::now()).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.purged_triggers, 1);

        let report = reaper
            .sweep_at(time::now() + ChronoDuration::minutes(31))
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 1);

        let job = backend.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert!(backend.get_trigger("t", fresh_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let reaper = Reaper::new(
            SharedBackend::new(MemoryBackend::new()),
            Duration::from_millis(10),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), reaper.run(shutdown))
            .await
            .unwrap();
    }
}
