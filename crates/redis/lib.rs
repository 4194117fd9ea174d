//! Redis backend for the tq job queue.
//!
//! This crate provides a Redis-based storage backend for the tq job queue.
//! Every state change runs inside a Lua script, so a claim, a settlement or a
//! trigger lock is a single atomic step on the server.
//!
//! ## Key layout
//!
//! All keys share the prefix `_tq_{namespace}:`.
//!
//! | key                     | type | contents                                 |
//! |-------------------------|------|------------------------------------------|
//! | `job:{id}`              | HASH | one field per record attribute           |
//! | `queue:{name}`          | ZSET | claimable ids scored by `available_at`   |
//! | `running`               | ZSET | claimed ids scored by `started_at`       |
//! | `stats:{name}`          | HASH | job count per state                      |
//! | `trigger:{task}:{key}`  | HASH | trigger lock row, expires after the TTL  |
//!
//! The claim, release and reclaim scripts touch job and stats keys that are
//! not passed through `KEYS`, so the adapter needs a single Redis node. It
//! does not run against Redis Cluster.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tq_redis::RedisBackend;
//! use tq_core::{Registry, SharedBackend};
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost", "shop").await?;
//!     let registry = Registry::new(SharedBackend::new(backend));
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tq_core::{
    time, validate_namespace, Backend, JobId, JobRecord, JobState, QueueStats, Result,
    Settlement, TqError, TriggerRecord,
};

/// Prefix for all tq-created keys.
const TQ_KEY_PREFIX: &str = "_tq_";

/// Default lifetime of a trigger row.
const DEFAULT_TRIGGER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Manages Redis keys with a namespace prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    namespace: String,
}

impl RedisKeys {
    /// Create a new RedisKeys instance with the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix shared by every key of this namespace.
    pub fn prefix(&self) -> String {
        format!("{}{}:", TQ_KEY_PREFIX, self.namespace)
    }

    /// Key for a job record (HASH).
    pub fn job(&self, job_id: &JobId) -> String {
        format!("{}job:{}", self.prefix(), job_id)
    }

    /// Key for a queue's claimable jobs (ZSET, scored by `available_at`).
    pub fn queue(&self, queue: &str) -> String {
        format!("{}queue:{}", self.prefix(), queue)
    }

    /// Key for all claimed jobs (ZSET, scored by `started_at`).
    pub fn running(&self) -> String {
        format!("{}running", self.prefix())
    }

    /// Key for a queue's per-state counters (HASH).
    pub fn stats(&self, queue: &str) -> String {
        format!("{}stats:{}", self.prefix(), queue)
    }

    /// Key for one trigger row (HASH).
    pub fn trigger(&self, task_id: &str, trigger_key: i64) -> String {
        format!("{}trigger:{}:{}", self.prefix(), task_id, trigger_key)
    }
}

// Shared by the reclaim and release scripts.
const REQUEUE_FN: &str = r#"
local function requeue(prefix, id, now, refund)
    local job = prefix .. 'job:' .. id
    redis.call('ZREM', prefix .. 'running', id)
    local queue = redis.call('HGET', job, 'queue_name')
    if not queue then
        return
    end
    redis.call('HSET', job, 'state', 'RETRYING', 'available_at', now)
    redis.call('HDEL', job, 'claimed_by')
    if refund then
        local attempts = tonumber(redis.call('HGET', job, 'attempts') or '0')
        if attempts > 0 then
            redis.call('HINCRBY', job, 'attempts', -1)
        end
    end
    redis.call('ZADD', prefix .. 'queue:' .. queue, now, id)
    redis.call('HINCRBY', prefix .. 'stats:' .. queue, 'RUNNING', -1)
    redis.call('HINCRBY', prefix .. 'stats:' .. queue, 'RETRYING', 1)
end
"#;

struct Scripts {
    enqueue: Script,
    claim: Script,
    settle: Script,
    progress: Script,
    cancel: Script,
    reclaim: Script,
    release: Script,
    lock_trigger: Script,
    complete_trigger: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            // KEYS[1] job; ARGV prefix, id, queue, state, available_at, field pairs...
            enqueue: Script::new(
                r#"
                if redis.call('EXISTS', KEYS[1]) == 1 then
                    return 0
                end
                local fields = {}
                for i = 6, #ARGV do
                    fields[#fields + 1] = ARGV[i]
                end
                redis.call('HSET', KEYS[1], unpack(fields))
                if ARGV[4] == 'PENDING' or ARGV[4] == 'RETRYING' then
                    redis.call('ZADD', ARGV[1] .. 'queue:' .. ARGV[3], ARGV[5], ARGV[2])
                end
                redis.call('HINCRBY', ARGV[1] .. 'stats:' .. ARGV[3], ARGV[4], 1)
                return 1
                "#,
            ),
            // ARGV prefix, now, worker, queue names...
            claim: Script::new(
                r#"
                local prefix, now = ARGV[1], ARGV[2]
                local best_id, best_queue, best_score
                for i = 4, #ARGV do
                    local head = redis.call('ZRANGEBYSCORE', prefix .. 'queue:' .. ARGV[i],
                        '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
                    if #head > 0 then
                        local score = tonumber(head[2])
                        if best_score == nil or score < best_score then
                            best_id, best_queue, best_score = head[1], ARGV[i], score
                        end
                    end
                end
                if best_id == nil then
                    return {}
                end
                local job = prefix .. 'job:' .. best_id
                redis.call('ZREM', prefix .. 'queue:' .. best_queue, best_id)
                local from = redis.call('HGET', job, 'state')
                if not from then
                    return {}
                end
                redis.call('HSET', job, 'state', 'RUNNING', 'claimed_by', ARGV[3], 'started_at', now)
                redis.call('HINCRBY', job, 'attempts', 1)
                redis.call('ZADD', prefix .. 'running', now, best_id)
                redis.call('HINCRBY', prefix .. 'stats:' .. best_queue, from, -1)
                redis.call('HINCRBY', prefix .. 'stats:' .. best_queue, 'RUNNING', 1)
                return redis.call('HGETALL', job)
                "#,
            ),
            // KEYS[1] job; ARGV prefix, id, worker, target, now, message, has_message, available_at
            settle: Script::new(
                r#"
                local current = redis.call('HMGET', KEYS[1], 'state', 'claimed_by', 'queue_name')
                if not current[1] then
                    return -1
                end
                if current[1] ~= 'RUNNING' or current[2] ~= ARGV[3] then
                    return 0
                end
                local prefix, id, target = ARGV[1], ARGV[2], ARGV[4]
                redis.call('HDEL', KEYS[1], 'claimed_by')
                redis.call('ZREM', prefix .. 'running', id)
                if target == 'COMPLETED' then
                    redis.call('HSET', KEYS[1], 'state', target, 'settled_at', ARGV[5])
                    if ARGV[7] == '1' then
                        redis.call('HSET', KEYS[1], 'result', ARGV[6])
                    end
                elseif target == 'RETRYING' then
                    redis.call('HSET', KEYS[1], 'state', target, 'last_error', ARGV[6],
                        'available_at', ARGV[8])
                    redis.call('ZADD', prefix .. 'queue:' .. current[3], ARGV[8], id)
                else
                    redis.call('HSET', KEYS[1], 'state', target, 'error', ARGV[6],
                        'last_error', ARGV[6], 'settled_at', ARGV[5])
                end
                redis.call('HINCRBY', prefix .. 'stats:' .. current[3], 'RUNNING', -1)
                redis.call('HINCRBY', prefix .. 'stats:' .. current[3], target, 1)
                return 1
                "#,
            ),
            // KEYS[1] job; ARGV worker, progress
            progress: Script::new(
                r#"
                local current = redis.call('HMGET', KEYS[1], 'state', 'claimed_by')
                if not current[1] then
                    return -1
                end
                if current[1] ~= 'RUNNING' or current[2] ~= ARGV[1] then
                    return 0
                end
                redis.call('HSET', KEYS[1], 'progress', ARGV[2])
                return 1
                "#,
            ),
            // KEYS[1] job; ARGV prefix, id, now
            cancel: Script::new(
                r#"
                local current = redis.call('HMGET', KEYS[1], 'state', 'queue_name')
                if not current[1] then
                    return 'MISSING'
                end
                if current[1] ~= 'PENDING' and current[1] ~= 'RETRYING' then
                    return current[1]
                end
                redis.call('HSET', KEYS[1], 'state', 'CANCELLED', 'settled_at', ARGV[3])
                redis.call('ZREM', ARGV[1] .. 'queue:' .. current[2], ARGV[2])
                redis.call('HINCRBY', ARGV[1] .. 'stats:' .. current[2], current[1], -1)
                redis.call('HINCRBY', ARGV[1] .. 'stats:' .. current[2], 'CANCELLED', 1)
                return 'OK'
                "#,
            ),
            // ARGV prefix, cutoff, now
            reclaim: Script::new(&format!(
                r#"
                {}
                local ids = redis.call('ZRANGEBYSCORE', ARGV[1] .. 'running', '-inf', '(' .. ARGV[2])
                for _, id in ipairs(ids) do
                    requeue(ARGV[1], id, ARGV[3], false)
                end
                return ids
                "#,
                REQUEUE_FN
            )),
            // ARGV prefix, worker, now
            release: Script::new(&format!(
                r#"
                {}
                local released = {{}}
                local ids = redis.call('ZRANGE', ARGV[1] .. 'running', 0, -1)
                for _, id in ipairs(ids) do
                    if redis.call('HGET', ARGV[1] .. 'job:' .. id, 'claimed_by') == ARGV[2] then
                        requeue(ARGV[1], id, ARGV[3], true)
                        released[#released + 1] = id
                    end
                end
                return released
                "#,
                REQUEUE_FN
            )),
            // KEYS[1] trigger; ARGV task_id, trigger_key, worker, now, ttl_ms
            lock_trigger: Script::new(
                r#"
                if redis.call('HSETNX', KEYS[1], 'locked_by', ARGV[3]) == 0 then
                    return 0
                end
                redis.call('HSET', KEYS[1], 'task_id', ARGV[1], 'trigger_key', ARGV[2],
                    'locked_at', ARGV[4])
                redis.call('PEXPIRE', KEYS[1], ARGV[5])
                return 1
                "#,
            ),
            // KEYS[1] trigger; ARGV worker, now, has_error, error
            complete_trigger: Script::new(
                r#"
                if redis.call('HGET', KEYS[1], 'locked_by') ~= ARGV[1] then
                    return 0
                end
                redis.call('HSET', KEYS[1], 'executed_at', ARGV[2])
                if ARGV[3] == '1' then
                    redis.call('HSET', KEYS[1], 'error', ARGV[4])
                else
                    redis.call('HDEL', KEYS[1], 'error')
                end
                return 1
                "#,
            ),
        }
    }
}

/// Redis backend for job queue storage.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    keys: RedisKeys,
    scripts: Arc<Scripts>,
    trigger_ttl: Duration,
}

impl RedisBackend {
    /// Create a new Redis backend.
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        let client = redis::Client::open(redis_url).map_err(|e| TqError::Backend(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        Self::with_connection(conn, namespace)
    }

    /// Create a new Redis backend with an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        let keys = RedisKeys::new(namespace);
        tracing::debug!(prefix = %keys.prefix(), "Redis backend ready");
        Ok(Self {
            conn,
            keys,
            scripts: Arc::new(Scripts::new()),
            trigger_ttl: DEFAULT_TRIGGER_TTL,
        })
    }

    /// Set how long trigger rows live.
    ///
    /// Redis expires trigger rows on its own, so `purge_triggers` is a no-op
    /// here. Keep the TTL well above the longest schedule period.
    pub fn with_trigger_ttl(mut self, ttl: Duration) -> Self {
        self.trigger_ttl = ttl;
        self
    }

    /// Get the Redis keys manager.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    fn claim_outcome(job_id: &JobId, worker_id: &str, code: i32) -> Result<()> {
        match code {
            1 => Ok(()),
            0 => Err(TqError::ClaimLost {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            }),
            _ => Err(TqError::JobNotFound(job_id.to_string())),
        }
    }
}

/// Flatten a record into hash field pairs. Absent optionals are omitted.
fn job_fields(job: &JobRecord) -> Result<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("queue_name", job.queue_name.clone()),
        ("data", serde_json::to_string(&job.data)?),
        ("state", job.state.as_str().to_string()),
        ("progress", job.progress.to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("created_at", time::to_millis(job.created_at).to_string()),
        ("available_at", time::to_millis(job.available_at).to_string()),
    ];
    if let Some(result) = &job.result {
        fields.push(("result", serde_json::to_string(result)?));
    }
    if let Some(error) = &job.error {
        fields.push(("error", error.clone()));
    }
    if let Some(last_error) = &job.last_error {
        fields.push(("last_error", last_error.clone()));
    }
    if let Some(started_at) = job.started_at {
        fields.push(("started_at", time::to_millis(started_at).to_string()));
    }
    if let Some(settled_at) = job.settled_at {
        fields.push(("settled_at", time::to_millis(settled_at).to_string()));
    }
    if let Some(claimed_by) = &job.claimed_by {
        fields.push(("claimed_by", claimed_by.clone()));
    }
    Ok(fields)
}

fn field<'a>(hash: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    hash.get(name)
        .map(String::as_str)
        .ok_or_else(|| TqError::Corrupt(format!("Job hash is missing field '{}'", name)))
}

fn number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| TqError::Corrupt(format!("Job hash field '{}' is not a number: {}", name, raw)))
}

fn instant(hash: &HashMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>> {
    hash.get(name)
        .map(|raw| number::<i64>(raw, name).map(time::from_millis))
        .transpose()
}

/// Rebuild a record from its hash. An empty hash means the key does not exist.
fn job_from_hash(hash: HashMap<String, String>) -> Result<Option<JobRecord>> {
    if hash.is_empty() {
        return Ok(None);
    }
    let progress: u8 = number(field(&hash, "progress")?, "progress")?;
    Ok(Some(JobRecord {
        id: JobId::parse(field(&hash, "id")?)?,
        queue_name: field(&hash, "queue_name")?.to_string(),
        data: serde_json::from_str(field(&hash, "data")?)?,
        state: field(&hash, "state")?.parse()?,
        progress: progress.min(100),
        result: hash
            .get("result")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?,
        error: hash.get("error").cloned(),
        last_error: hash.get("last_error").cloned(),
        attempts: number(field(&hash, "attempts")?, "attempts")?,
        max_attempts: number(field(&hash, "max_attempts")?, "max_attempts")?,
        created_at: time::from_millis(number(field(&hash, "created_at")?, "created_at")?),
        available_at: time::from_millis(number(field(&hash, "available_at")?, "available_at")?),
        started_at: instant(&hash, "started_at")?,
        settled_at: instant(&hash, "settled_at")?,
        claimed_by: hash.get("claimed_by").cloned(),
    }))
}

fn trigger_from_hash(hash: HashMap<String, String>) -> Result<Option<TriggerRecord>> {
    if hash.is_empty() {
        return Ok(None);
    }
    Ok(Some(TriggerRecord {
        task_id: field(&hash, "task_id")?.to_string(),
        trigger_key: time::from_millis(number(field(&hash, "trigger_key")?, "trigger_key")?),
        locked_by: hash.get("locked_by").cloned(),
        locked_at: instant(&hash, "locked_at")?,
        executed_at: instant(&hash, "executed_at")?,
        error: hash.get("error").cloned(),
    }))
}

fn parse_ids(ids: Vec<String>) -> Result<Vec<JobId>> {
    ids.iter().map(|id| JobId::parse(id)).collect()
}

#[async_trait]
impl Backend for RedisBackend {
    async fn enqueue(&self, job: &JobRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.enqueue.key(self.keys.job(&job.id));
        invocation
            .arg(self.keys.prefix())
            .arg(job.id.to_string())
            .arg(&job.queue_name)
            .arg(job.state.as_str())
            .arg(time::to_millis(job.available_at));
        for (name, value) in job_fields(job)? {
            invocation.arg(name).arg(value);
        }

        let inserted: i32 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        if inserted == 0 {
            return Err(TqError::Backend(format!("Job {} already exists", job.id)));
        }
        Ok(())
    }

    async fn claim_next(&self, queues: &[String], worker_id: &str) -> Result<Option<JobRecord>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .arg(self.keys.prefix())
            .arg(time::to_millis(time::now()))
            .arg(worker_id);
        for queue in queues {
            invocation.arg(queue);
        }

        let hash: HashMap<String, String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;

        let claimed_id = hash.get("id").and_then(|raw| JobId::parse(raw).ok());
        match job_from_hash(hash) {
            Ok(job) => Ok(job),
            Err(e) => {
                let reason = format!("Claimed job could not be decoded: {}", e);
                tracing::error!(job_id = ?claimed_id, %reason, "Failed undecodable job");
                if let Some(job_id) = claimed_id {
                    self.settle(&job_id, worker_id, Settlement::Failed { error: reason.clone() })
                        .await?;
                }
                Err(TqError::Corrupt(reason))
            }
        }
    }

    async fn settle(&self, job_id: &JobId, worker_id: &str, outcome: Settlement) -> Result<()> {
        let target = outcome.target_state();
        let now = time::to_millis(time::now());
        let (message, has_message, available_at) = match outcome {
            Settlement::Completed { result } => match result {
                Some(value) => (serde_json::to_string(&value)?, true, now),
                None => (String::new(), false, now),
            },
            Settlement::Retry {
                error,
                available_at,
            } => (error, true, time::to_millis(available_at)),
            Settlement::Failed { error } => (error, true, now),
        };

        let mut conn = self.conn.clone();
        let code: i32 = self
            .scripts
            .settle
            .key(self.keys.job(job_id))
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .arg(worker_id)
            .arg(target.as_str())
            .arg(now)
            .arg(message)
            .arg(if has_message { "1" } else { "0" })
            .arg(available_at)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        Self::claim_outcome(job_id, worker_id, code)
    }

    async fn update_progress(&self, job_id: &JobId, worker_id: &str, progress: u8) -> Result<()> {
        let mut conn = self.conn.clone();
        let code: i32 = self
            .scripts
            .progress
            .key(self.keys.job(job_id))
            .arg(worker_id)
            .arg(progress.min(100))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        Self::claim_outcome(job_id, worker_id, code)
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .cancel
            .key(self.keys.job(job_id))
            .arg(self.keys.prefix())
            .arg(job_id.to_string())
            .arg(time::to_millis(time::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;

        match outcome.as_str() {
            "OK" => Ok(()),
            "MISSING" => Err(TqError::JobNotFound(job_id.to_string())),
            state => Err(TqError::InvalidState {
                job_id: job_id.to_string(),
                state: state.parse()?,
                operation: "cancel",
            }),
        }
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn
            .hgetall(self.keys.job(job_id))
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        job_from_hash(hash)
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let counts: HashMap<String, i64> = conn
            .hgetall(self.keys.stats(queue))
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;

        let mut stats = QueueStats::default();
        for (state, count) in counts {
            stats.add(state.parse::<JobState>()?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .scripts
            .reclaim
            .arg(self.keys.prefix())
            .arg(time::to_millis(started_before))
            .arg(time::to_millis(time::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        parse_ids(ids)
    }

    async fn release_claims(&self, worker_id: &str) -> Result<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .scripts
            .release
            .arg(self.keys.prefix())
            .arg(worker_id)
            .arg(time::to_millis(time::now()))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        parse_ids(ids)
    }

    async fn try_lock_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<bool> {
        let key = time::to_millis(trigger_key);
        let ttl_ms = u64::try_from(self.trigger_ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.conn.clone();
        let locked: i32 = self
            .scripts
            .lock_trigger
            .key(self.keys.trigger(task_id, key))
            .arg(task_id)
            .arg(key)
            .arg(worker_id)
            .arg(time::to_millis(time::now()))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        Ok(locked == 1)
    }

    async fn complete_trigger(
        &self,
        task_id: &str,
        trigger_key: DateTime<Utc>,
        worker_id: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let key = time::to_millis(trigger_key);
        let mut conn = self.conn.clone();
        let done: i32 = self
            .scripts
            .complete_trigger
            .key(self.keys.trigger(task_id, key))
            .arg(worker_id)
            .arg(time::to_millis(time::now()))
            .arg(if error.is_some() { "1" } else { "0" })
            .arg(error.unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;

        if done == 0 {
            return Err(TqError::TriggerLost {
                task_id: task_id.to_string(),
                trigger_key: key,
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
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn
            .hgetall(self.keys.trigger(task_id, time::to_millis(trigger_key)))
            .await
            .map_err(|e| TqError::Backend(e.to_string()))?;
        trigger_from_hash(hash)
    }

    async fn purge_triggers(&self, _before: DateTime<Utc>) -> Result<u64> {
        // Trigger rows carry a TTL.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("shop");
        let id = JobId::parse("6f1c2f6e-5d55-4c3e-9a7f-0c6c6f0f8a11").unwrap();
        assert_eq!(keys.namespace(), "shop");
        assert_eq!(keys.prefix(), "_tq_shop:");
        assert_eq!(
            keys.job(&id),
            "_tq_shop:job:6f1c2f6e-5d55-4c3e-9a7f-0c6c6f0f8a11"
        );
        assert_eq!(keys.queue("email"), "_tq_shop:queue:email");
        assert_eq!(keys.running(), "_tq_shop:running");
        assert_eq!(keys.stats("email"), "_tq_shop:stats:email");
        assert_eq!(
            keys.trigger("nightly", 1_700_000_000_000),
            "_tq_shop:trigger:nightly:1700000000000"
        );
    }

    #[test]
    fn test_job_hash_roundtrip() {
        let mut job = JobRecord::new(
            "email",
            serde_json::json!({"to": "a@example.com", "tags": []}),
            5,
            None,
        );
        job.state = JobState::Completed;
        job.attempts = 2;
        job.progress = 100;
        job.result = Some(serde_json::json!({"message_id": 42}));
        job.last_error = Some(String::new());
        job.settled_at = Some(time::now());

        let hash: HashMap<String, String> = job_fields(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert!(!hash.contains_key("claimed_by"));
        assert!(!hash.contains_key("started_at"));
        assert_eq!(job_from_hash(hash).unwrap(), Some(job));
    }

    #[test]
    fn test_empty_hash_is_missing() {
        assert!(job_from_hash(HashMap::new()).unwrap().is_none());
        assert!(trigger_from_hash(HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_hash_is_not_transient() {
        let mut hash = HashMap::new();
        hash.insert("id".to_string(), JobId::new().to_string());
        let err = job_from_hash(hash).unwrap_err();
        assert!(matches!(err, TqError::Corrupt(_)));
        assert!(!err.is_transient());
    }
}

// ========== Integration Tests (require Redis) ==========

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_namespace() -> String {
        format!("tq_test_{}", JobId::new().0.simple())
    }

    async fn backend() -> RedisBackend {
        RedisBackend::new(&redis_url(), &test_namespace())
            .await
            .expect("Failed to connect to Redis")
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_claim_settle_lifecycle() {
        let backend = backend().await;
        let first = JobRecord::new("email", serde_json::json!({"n": 1}), 3, None);
        let second = JobRecord::new("email", serde_json::json!({"n": 2}), 3, None);
        backend.enqueue(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.enqueue(&second).await.unwrap();
        assert!(backend.enqueue(&first).await.is_err());
        assert_eq!(backend.get_job(&first.id).await.unwrap(), Some(first.clone()));

        let claimed = backend
            .claim_next(&queues(&["email"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempts, 1);

        assert!(matches!(
            backend.update_progress(&first.id, "w2", 10).await,
            Err(TqError::ClaimLost { .. })
        ));
        backend.update_progress(&first.id, "w1", 40).await.unwrap();

        let later = time::now() + ChronoDuration::seconds(60);
        backend
            .settle(
                &first.id,
                "w1",
                Settlement::Retry {
                    error: "timeout".to_string(),
                    available_at: later,
                },
            )
            .await
            .unwrap();

        // The retried job is delayed, so the second one comes next.
        let next = backend
            .claim_next(&queues(&["email"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, second.id);
        backend
            .settle(
                &second.id,
                "w1",
                Settlement::Completed {
                    result: Some(serde_json::json!("sent")),
                },
            )
            .await
            .unwrap();

        let stats = backend.queue_stats("email").await.unwrap();
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);

        let done = backend.get_job(&second.id).await.unwrap().unwrap();
        assert_eq!(done.result, Some(serde_json::json!("sent")));
        assert!(matches!(
            backend
                .settle(&JobId::new(), "w1", Settlement::Completed { result: None })
                .await,
            Err(TqError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_cancel_and_release() {
        let backend = backend().await;
        let pending = JobRecord::new("search", serde_json::Value::Null, 3, None);
        let running = JobRecord::new("search", serde_json::Value::Null, 3, None);
        backend.enqueue(&running).await.unwrap();
        backend.claim_next(&queues(&["search"]), "w1").await.unwrap();
        backend.enqueue(&pending).await.unwrap();

        backend.cancel(&pending.id).await.unwrap();
        assert!(matches!(
            backend.cancel(&running.id).await,
            Err(TqError::InvalidState {
                state: JobState::Running,
                ..
            })
        ));
        assert!(matches!(
            backend.cancel(&JobId::new()).await,
            Err(TqError::JobNotFound(_))
        ));

        assert_eq!(
            backend.release_claims("w1").await.unwrap(),
            vec![running.id.clone()]
        );
        let released = backend.get_job(&running.id).await.unwrap().unwrap();
        assert_eq!(released.state, JobState::Retrying);
        assert_eq!(released.attempts, 0);
        assert!(released.claimed_by.is_none());

        let stats = backend.queue_stats("search").await.unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.retrying, 1);
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_reclaim_stale() {
        let backend = backend().await;
        let job = JobRecord::new("email", serde_json::Value::Null, 3, None);
        backend.enqueue(&job).await.unwrap();
        backend.claim_next(&queues(&["email"]), "dead").await.unwrap();

        assert!(backend
            .reclaim_stale(time::now() - ChronoDuration::minutes(5))
            .await
            .unwrap()
            .is_empty());
        let reclaimed = backend
            .reclaim_stale(time::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed, vec![job.id.clone()]);
        assert!(matches!(
            backend
                .settle(&job.id, "dead", Settlement::Completed { result: None })
                .await,
            Err(TqError::ClaimLost { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_trigger_lock_race() {
        let backend = backend().await.with_trigger_ttl(Duration::from_secs(60));
        let key = time::from_millis(1_700_000_000_000);

        let mut handles = Vec::new();
        for w in 0..10 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("w{}", w);
                let won = backend
                    .try_lock_trigger("price-sync", key, &worker)
                    .await
                    .unwrap();
                won.then_some(worker)
            }));
        }
        let mut winners = HashSet::new();
        for handle in handles {
            if let Some(worker) = handle.await.unwrap() {
                winners.insert(worker);
            }
        }
        assert_eq!(winners.len(), 1);

        let winner = winners.into_iter().next().unwrap();
        assert!(matches!(
            backend
                .complete_trigger("price-sync", key, "someone-else", None)
                .await,
            Err(TqError::TriggerLost { .. })
        ));
        backend
            .complete_trigger("price-sync", key, &winner, Some("upstream 503"))
            .await
            .unwrap();

        let row = backend
            .get_trigger("price-sync", key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.locked_by.as_deref(), Some(winner.as_str()));
        assert_eq!(row.error.as_deref(), Some("upstream 503"));
        assert!(row.executed_at.is_some());
        assert_eq!(backend.purge_triggers(time::now()).await.unwrap(), 0);
    }
}
