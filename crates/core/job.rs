//! Job record, state lattice and related types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, TqError};

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a JobId from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TqError::JobNotFound(format!("{} ({})", s, e)))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The state of a job.
///
/// ```text
/// PENDING  --claim-->  RUNNING --success--> COMPLETED
/// PENDING  --cancel--> CANCELLED
/// RUNNING  --failure, attempts < max-->  RETRYING --claim--> RUNNING
/// RUNNING  --failure, attempts >= max--> FAILED
/// RETRYING --cancel--> CANCELLED
/// RUNNING  --stale reclaim / shutdown release--> RETRYING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
        JobState::Retrying,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Retrying => "RETRYING",
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `claim_next` may pick a job in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Retrying)
    }

    /// Whether `cancel` may move a job in this state to `CANCELLED`.
    pub fn is_cancellable(&self) -> bool {
        self.is_claimable()
    }

    /// Check an edge of the state lattice.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = TqError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| TqError::Corrupt(format!("Unknown job state: {}", s)))
    }
}

/// Per-job overrides given at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delay before the job becomes claimable.
    pub delay: Option<Duration>,
    /// Override of the queue's attempt ceiling.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    /// Make the job claimable only after `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Override the queue's `max_attempts` for this job.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// The durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: String,
    /// Opaque payload, never touched by the queue machinery.
    pub data: serde_json::Value,
    pub state: JobState,
    /// 0..=100, written only by the claiming worker while running.
    pub progress: u8,
    /// Set once, on the transition to `COMPLETED`.
    pub result: Option<serde_json::Value>,
    /// Set once, on the transition to `FAILED`.
    pub error: Option<String>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time at which the job may be claimed.
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

impl JobRecord {
    /// Build a new `PENDING` record.
    pub fn new(
        queue_name: impl Into<String>,
        data: serde_json::Value,
        max_attempts: u32,
        delay: Option<Duration>,
    ) -> Self {
        let now = crate::time::now();
        let available_at = match delay {
            Some(delay) => ChronoDuration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => now,
        };

        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            data,
            state: JobState::Pending,
            progress: 0,
            result: None,
            error: None,
            last_error: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            available_at,
            started_at: None,
            settled_at: None,
            claimed_by: None,
        }
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.available_at <= now
    }

    /// Serialize the job to JSON.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The outcome handed to `Backend::settle` for a running job.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// RUNNING -> COMPLETED.
    Completed { result: Option<serde_json::Value> },
    /// RUNNING -> RETRYING, claimable again at `available_at`.
    Retry {
        error: String,
        available_at: DateTime<Utc>,
    },
    /// RUNNING -> FAILED.
    Failed { error: String },
}

impl Settlement {
    /// The state this settlement moves the job into.
    pub fn target_state(&self) -> JobState {
        match self {
            Settlement::Completed { .. } => JobState::Completed,
            Settlement::Retry { .. } => JobState::Retrying,
            Settlement::Failed { .. } => JobState::Failed,
        }
    }

    /// Apply this settlement to a record in place.
    ///
    /// Used by backends that manipulate records in memory.
    pub fn apply(self, job: &mut JobRecord, now: DateTime<Utc>) {
        job.state = self.target_state();
        job.claimed_by = None;
        match self {
            Settlement::Completed { result } => {
                job.result = result;
                job.settled_at = Some(now);
            }
            Settlement::Retry {
                error,
                available_at,
            } => {
                job.last_error = Some(error);
                job.available_at = available_at;
            }
            Settlement::Failed { error } => {
                job.last_error = Some(error.clone());
                job.error = Some(error);
                job.settled_at = Some(now);
            }
        }
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Add `count` jobs in `state`.
    pub fn add(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Retrying => &mut self.retrying,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    /// Jobs that reached COMPLETED, FAILED or CANCELLED.
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.retrying + self.settled()
    }
}

/// One occurrence of a recurring scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub task_id: String,
    /// Canonical occurrence instant.
    pub trigger_key: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Failure text when the occurrence ran but failed.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation() {
        let job = JobRecord::new("send-email", serde_json::json!({"to": "a@b.c"}), 3, None);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.available_at, job.created_at);
        assert!(job.claimed_by.is_none());
        assert!(job.is_claimable_at(job.created_at));
    }

    #[test]
    fn test_job_creation_with_delay() {
        let job = JobRecord::new("reindex", serde_json::Value::Null, 1, Some(Duration::from_secs(60)));
        assert_eq!(job.available_at - job.created_at, ChronoDuration::seconds(60));
        assert!(!job.is_claimable_at(job.created_at));
        assert!(job.is_claimable_at(job.available_at));
    }

    #[test]
    fn test_job_id_uniqueness() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_job_id_parse_roundtrip() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()).unwrap(), id);
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_job_id_serializes_as_plain_string() {
        let id = JobId::new();
        assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{}\"", id));
    }

    #[test]
    fn test_state_storage_names() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.as_str())
            );
        }
        assert!(matches!(
            "DONE".parse::<JobState>(),
            Err(TqError::Corrupt(_))
        ));
    }

    #[test]
    fn test_state_lattice() {
        use JobState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Retrying.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Retrying));

        assert!(!Running.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Retrying.can_transition_to(Failed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in JobState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_settlement_apply_completed() {
        let mut job = JobRecord::new("q", serde_json::Value::Null, 3, None);
        job.state = JobState::Running;
        job.claimed_by = Some("w1".to_string());
        let now = crate::time::now();

        Settlement::Completed {
            result: Some(serde_json::json!({"indexed": 12})),
        }
        .apply(&mut job, now);

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(serde_json::json!({"indexed": 12})));
        assert_eq!(job.settled_at, Some(now));
        assert!(job.claimed_by.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_settlement_apply_retry_keeps_job_open() {
        let mut job = JobRecord::new("q", serde_json::Value::Null, 3, None);
        job.state = JobState::Running;
        job.claimed_by = Some("w1".to_string());
        let now = crate::time::now();
        let later = now + ChronoDuration::seconds(10);

        Settlement::Retry {
            error: "smtp timeout".to_string(),
            available_at: later,
        }
        .apply(&mut job, now);

        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.available_at, later);
        assert_eq!(job.last_error.as_deref(), Some("smtp timeout"));
        assert!(job.error.is_none());
        assert!(job.settled_at.is_none());
        assert!(job.claimed_by.is_none());
    }

    #[test]
    fn test_settlement_apply_failed() {
        let mut job = JobRecord::new("q", serde_json::Value::Null, 3, None);
        job.state = JobState::Running;
        let now = crate::time::now();

        Settlement::Failed {
            error: "boom".to_string(),
        }
        .apply(&mut job, now);

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.settled_at, Some(now));
    }

    #[test]
    fn test_queue_stats_add() {
        let mut stats = QueueStats::default();
        stats.add(JobState::Completed, 3);
        stats.add(JobState::Failed, 1);
        stats.add(JobState::Pending, 2);
        assert_eq!(stats.settled(), 4);
        assert_eq!(stats.total(), 6);
    }

    #[test]
    fn test_job_record_json_roundtrip() {
        let job = JobRecord::new("q", serde_json::json!([1, 2, 3]), 5, None);
        let json = job.to_json().unwrap();
        let parsed: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, job);
    }
}
