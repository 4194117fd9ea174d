//! SQLite backend for the tq job queue.
//!
//! Jobs and trigger rows live in two tables prefixed with the namespace. A
//! claim is a single `UPDATE ... RETURNING` whose subquery picks the oldest
//! eligible row, so SQLite's write serialization makes it race-free. Trigger
//! locks are a single `INSERT OR IGNORE` on the `(task_id, trigger_key)`
//! primary key: the caller whose insert lands is the winner.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tq_core::{Registry, SharedBackend};
//! use tq_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:jobs.db?mode=rwc", "shop").await?;
//!     let registry = Registry::new(SharedBackend::new(backend));
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tq_core::{
    time, validate_namespace, Backend, JobId, JobRecord, JobState, QueueStats, Result,
    Settlement, TqError, TriggerRecord,
};

const JOB_COLUMNS: &str = "id, queue_name, data, state, progress, result, error, last_error, \
    attempts, max_attempts, created_at, available_at, started_at, settled_at, claimed_by";

/// SQLite backend for job queue storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;

        // One connection: SQLite serializes writers anyway, and an in-memory
        // database only lives as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .map_err(|e| TqError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        let backend = Self {
            pool,
            namespace: namespace.to_string(),
        };

        backend.init_tables().await?;
        tracing::debug!(namespace = %backend.namespace, "SQLite backend ready");

        Ok(backend)
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue_name TEXT NOT NULL,
                data TEXT NOT NULL,
                state TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                started_at INTEGER,
                settled_at INTEGER,
                claimed_by TEXT
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to create jobs table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_jobs_claim ON {} (queue_name, state, available_at)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to create jobs index: {}", e)))?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                task_id TEXT NOT NULL,
                trigger_key INTEGER NOT NULL,
                locked_by TEXT,
                locked_at INTEGER,
                executed_at INTEGER,
                error TEXT,
                PRIMARY KEY (task_id, trigger_key)
            )
            "#,
            self.triggers_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to create triggers table: {}", e)))?;

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    fn triggers_table(&self) -> String {
        format!("{}_triggers", self.namespace)
    }

    /// Distinguish a missing job from one held by somebody else.
    /// Park a claimed row that cannot be decoded as `FAILED` so it is not
    /// claimed again or left `RUNNING`.
    async fn fail_undecodable(&self, raw_id: &str, worker_id: &str, reason: &str) {
        let sql = format!(
            "UPDATE {} SET state = 'FAILED', error = ?, settled_at = ? \
             WHERE id = ? AND state = 'RUNNING' AND claimed_by = ?",
            self.jobs_table()
        );
        let result = sqlx::query(&sql)
            .bind(reason)
            .bind(time::to_millis(time::now()))
            .bind(raw_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => tracing::error!(job_id = %raw_id, %reason, "Failed undecodable job"),
            Err(e) => tracing::error!(job_id = %raw_id, error = %e, "Failed to park undecodable job"),
        }
    }

    async fn claim_error(&self, job_id: &JobId, worker_id: &str) -> TqError {
        match self.get_job(job_id).await {
            Ok(Some(_)) => TqError::ClaimLost {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            },
            Ok(None) => TqError::JobNotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    queue_name: String,
    data: String,
    state: String,
    progress: i64,
    result: Option<String>,
    error: Option<String>,
    last_error: Option<String>,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    available_at: i64,
    started_at: Option<i64>,
    settled_at: Option<i64>,
    claimed_by: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = TqError;

    fn try_from(row: JobRow) -> Result<Self> {
        let id = JobId::parse(&row.id)
            .map_err(|_| TqError::Corrupt(format!("Job id {}", row.id)))?;
        Ok(JobRecord {
            id,
            queue_name: row.queue_name,
            data: serde_json::from_str(&row.data)?,
            state: row.state.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            error: row.error,
            last_error: row.last_error,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            created_at: time::from_millis(row.created_at),
            available_at: time::from_millis(row.available_at),
            started_at: row.started_at.map(time::from_millis),
            settled_at: row.settled_at.map(time::from_millis),
            claimed_by: row.claimed_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    task_id: String,
    trigger_key: i64,
    locked_by: Option<String>,
    locked_at: Option<i64>,
    executed_at: Option<i64>,
    error: Option<String>,
}

impl From<TriggerRow> for TriggerRecord {
    fn from(row: TriggerRow) -> Self {
        TriggerRecord {
            task_id: row.task_id,
            trigger_key: time::from_millis(row.trigger_key),
            locked_by: row.locked_by,
            locked_at: row.locked_at.map(time::from_millis),
            executed_at: row.executed_at.map(time::from_millis),
            error: row.error,
        }
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn enqueue(&self, job: &JobRecord) -> Result<()> {
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.jobs_table(),
            JOB_COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(&job.queue_name)
        .bind(serde_json::to_string(&job.data)?)
        .bind(job.state.as_str())
        .bind(i64::from(job.progress))
        .bind(result)
        .bind(&job.error)
        .bind(&job.last_error)
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(time::to_millis(job.created_at))
        .bind(time::to_millis(job.available_at))
        .bind(job.started_at.map(time::to_millis))
        .bind(job.settled_at.map(time::to_millis))
        .bind(&job.claimed_by)
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to enqueue job: {}", e)))?;
        Ok(())
    }

    async fn claim_next(&self, queues: &[String], worker_id: &str) -> Result<Option<JobRecord>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let now = time::to_millis(time::now());
        let placeholders = vec!["?"; queues.len()].join(", ");

        let sql = format!(
            r#"
            UPDATE {table}
            SET state = 'RUNNING', claimed_by = ?, started_at = ?, attempts = attempts + 1
            WHERE seq = (
                SELECT seq FROM {table}
                WHERE queue_name IN ({placeholders})
                  AND state IN ('PENDING', 'RETRYING')
                  AND available_at <= ?
                ORDER BY seq
                LIMIT 1
            )
            RETURNING {columns}
            "#,
            table = self.jobs_table(),
            placeholders = placeholders,
            columns = JOB_COLUMNS,
        );

        let mut query = sqlx::query_as::<_, JobRow>(&sql).bind(worker_id).bind(now);
        for queue in queues {
            query = query.bind(queue);
        }
        let row = query
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TqError::Backend(format!("Failed to claim job: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw_id = row.id.clone();
        match JobRecord::try_from(row) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                let reason = format!("Job {} could not be decoded: {}", raw_id, e);
                self.fail_undecodable(&raw_id, worker_id, &reason).await;
                Err(TqError::Corrupt(reason))
            }
        }
    }

    async fn settle(&self, job_id: &JobId, worker_id: &str, outcome: Settlement) -> Result<()> {
        let now = time::to_millis(time::now());
        let table = self.jobs_table();
        let guard = "WHERE id = ? AND state = 'RUNNING' AND claimed_by = ?";

        let sql = match &outcome {
            Settlement::Completed { .. } => format!(
                "UPDATE {} SET state = 'COMPLETED', result = ?, settled_at = ?, claimed_by = NULL {}",
                table, guard
            ),
            Settlement::Retry { .. } => format!(
                "UPDATE {} SET state = 'RETRYING', last_error = ?, available_at = ?, claimed_by = NULL {}",
                table, guard
            ),
            Settlement::Failed { .. } => format!(
                "UPDATE {} SET state = 'FAILED', error = ?, last_error = ?, settled_at = ?, claimed_by = NULL {}",
                table, guard
            ),
        };

        let query = sqlx::query(&sql);
        let query = match outcome {
            Settlement::Completed { result } => query
                .bind(result.as_ref().map(serde_json::to_string).transpose()?)
                .bind(now),
            Settlement::Retry {
                error,
                available_at,
            } => query.bind(error).bind(time::to_millis(available_at)),
            Settlement::Failed { error } => query.bind(error.clone()).bind(error).bind(now),
        };

        let done = query
            .bind(job_id.to_string())
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| TqError::Backend(format!("Failed to settle job: {}", e)))?;

        if done.rows_affected() == 0 {
            return Err(self.claim_error(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn update_progress(&self, job_id: &JobId, worker_id: &str, progress: u8) -> Result<()> {
        let done = sqlx::query(&format!(
            "UPDATE {} SET progress = ? WHERE id = ? AND state = 'RUNNING' AND claimed_by = ?",
            self.jobs_table()
        ))
        .bind(i64::from(progress.min(100)))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to update progress: {}", e)))?;

        if done.rows_affected() == 0 {
            return Err(self.claim_error(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let done = sqlx::query(&format!(
            "UPDATE {} SET state = 'CANCELLED', settled_at = ? WHERE id = ? AND state IN ('PENDING', 'RETRYING')",
            self.jobs_table()
        ))
        .bind(time::to_millis(time::now()))
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to cancel job: {}", e)))?;

        if done.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_job(job_id).await? {
            Some(job) => Err(TqError::InvalidState {
                job_id: job_id.to_string(),
                state: job.state,
                operation: "cancel",
            }),
            None => Err(TqError::JobNotFound(job_id.to_string())),
        }
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            JOB_COLUMNS,
            self.jobs_table()
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to get job: {}", e)))?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT state, COUNT(*) FROM {} WHERE queue_name = ? GROUP BY state",
            self.jobs_table()
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to get queue stats: {}", e)))?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.add(state.parse::<JobState>()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<JobId>> {
        let ids: Vec<(String,)> = sqlx::query_as(&format!(
            "UPDATE {} SET state = 'RETRYING', claimed_by = NULL, available_at = ? \
             WHERE state = 'RUNNING' AND started_at < ? RETURNING id",
            self.jobs_table()
        ))
        .bind(time::to_millis(time::now()))
        .bind(time::to_millis(started_before))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to reclaim stale jobs: {}", e)))?;

        ids.into_iter().map(|(id,)| JobId::parse(&id)).collect()
    }

    async fn release_claims(&self, worker_id: &str) -> Result<Vec<JobId>> {
        let ids: Vec<(String,)> = sqlx::query_as(&format!(
            "UPDATE {} SET state = 'RETRYING', claimed_by = NULL, available_at = ?, \
             attempts = MAX(attempts - 1, 0) \
             WHERE state = 'RUNNING' AND claimed_by = ? RETURNING id",
            self.jobs_table()
        ))
        .bind(time::to_millis(time::now()))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to release claims: {}", e)))?;

        ids.into_iter().map(|(id,)| JobId::parse(&id)).collect()
    }

    async fn try_lock_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<bool> {
        let done = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (task_id, trigger_key, locked_by, locked_at) VALUES (?, ?, ?, ?)",
            self.triggers_table()
        ))
        .bind(task_id)
        .bind(time::to_millis(trigger_key))
        .bind(worker_id)
        .bind(time::to_millis(time::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to lock trigger: {}", e)))?;

        Ok(done.rows_affected() == 1)
    }

    async fn complete_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let done = sqlx::query(&format!(
            "UPDATE {} SET executed_at = ?, error = ? WHERE task_id = ? AND trigger_key = ? AND locked_by = ?",
            self.triggers_table()
        ))
        .bind(time::to_millis(time::now()))
        .bind(error)
        .bind(task_id)
        .bind(time::to_millis(trigger_key))
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to complete trigger: {}", e)))?;

        if done.rows_affected() == 0 {
            return Err(TqError::TriggerLost {
                task_id: task_id.to_string(),
                trigger_key: time::to_millis(trigger_key),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
    ) -> Result<Option<TriggerRecord>> {
        let row: Option<TriggerRow> = sqlx::query_as(&format!(
            "SELECT task_id, trigger_key, locked_by, locked_at, executed_at, error \
             FROM {} WHERE task_id = ? AND trigger_key = ?",
            self.triggers_table()
        ))
        .bind(task_id)
        .bind(time::to_millis(trigger_key))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to get trigger: {}", e)))?;

        Ok(row.map(TriggerRecord::from))
    }

    async fn purge_triggers(&self, before: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query(&format!(
            "DELETE FROM {} WHERE trigger_key < ?",
            self.triggers_table()
        ))
        .bind(time::to_millis(before))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to purge triggers: {}", e)))?;

        Ok(done.rows_affected())
    }
}
