//! Redis-backed durable job store.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! {prefix}:seq               counter for insertion order
//! {prefix}:job:{id}          hash, one field per persisted job attribute
//! {prefix}:pending:{type}    zset per job type, score = -priority * 1e12 + seq
//! {prefix}:retrying          zset, score = next_run_at (ms)
//! {prefix}:finished          zset, score = completion/failure/cancel time (ms)
//! {prefix}:status:{status}   set of job ids
//! ```
//!
//! Inserts and version-checked replacements run as Lua scripts so the hash
//! and its indexes change together.

use super::JobStore;
use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobType};
use crate::queue::Priority;
use crate::status::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::{debug, info};

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job store...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for the job store.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Insertion sequence counter.
    pub fn seq(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    /// Job data key (hash).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Pending jobs of one type (sorted set by priority + seq).
    pub fn pending(&self, job_type: JobType) -> String {
        format!("{}:pending:{}", self.prefix, job_type.as_str())
    }

    /// Retrying jobs (sorted set by due time).
    pub fn retrying(&self) -> String {
        format!("{}:retrying", self.prefix)
    }

    /// Finished jobs (sorted set by finish time).
    pub fn finished(&self) -> String {
        format!("{}:finished", self.prefix)
    }

    /// Prefix shared by the per-status sets.
    pub fn status_prefix(&self) -> String {
        format!("{}:status:", self.prefix)
    }

    /// Set of job ids in a status.
    pub fn status(&self, status: JobStatus) -> String {
        format!("{}{}", self.status_prefix(), status.as_str())
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("beacon:jobs")
    }
}

const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return redis.error_reply('job already exists')
end
local seq = redis.call('INCR', KEYS[1])
redis.call('HSET', KEYS[2], 'seq', seq, 'version', 1, unpack(ARGV, 4))
if ARGV[3] == '1' then
  redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + seq, ARGV[2])
end
redis.call('SADD', KEYS[4], ARGV[2])
return seq
"#;

const REPLACE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current or tonumber(current) ~= tonumber(ARGV[1]) then
  return 0
end
local seq = redis.call('HGET', KEYS[1], 'seq')
local old_status = redis.call('HGET', KEYS[1], 'status')
local version = tonumber(current) + 1
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'seq', seq, 'version', version, unpack(ARGV, 8))
redis.call('SREM', ARGV[7] .. old_status, ARGV[2])
redis.call('SADD', ARGV[7] .. ARGV[3], ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('ZREM', KEYS[3], ARGV[2])
if ARGV[3] == 'pending' then
  redis.call('ZADD', KEYS[2], tonumber(ARGV[4]) + tonumber(seq), ARGV[2])
elseif ARGV[3] == 'retrying' then
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[2])
elseif ARGV[3] == 'completed' or ARGV[3] == 'failed' or ARGV[3] == 'cancelled' then
  redis.call('ZADD', KEYS[4], ARGV[6], ARGV[2])
end
return version
"#;

/// Redis-backed job store.
pub struct RedisJobStore {
    pool: Pool,
    keys: RedisKeys,
    insert_script: Script,
    replace_script: Script,
}

impl RedisJobStore {
    /// Create a new Redis job store.
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            insert_script: Script::new(INSERT_SCRIPT),
            replace_script: Script::new(REPLACE_SCRIPT),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Higher priority = lower score (dispatched first); `seq` is added in
    /// the script so equal priorities stay FIFO.
    fn priority_base(priority: Priority) -> f64 {
        -(priority.value() as f64) * 1_000_000_000_000.0
    }

    async fn fetch_many(&self, ids: &[String]) -> JobResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hgetall(self.keys.job(id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut *conn).await?;

        hashes
            .into_iter()
            .filter(|fields| !fields.is_empty())
            .map(decode_job)
            .collect()
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(field: &str, raw: &str) -> JobResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| JobError::Store(format!("Invalid timestamp in field {}: {}", field, e)))
}

/// Flattens a job into hash fields. `seq` and `version` are owned by the
/// scripts and not included.
pub(crate) fn encode_job(job: &Job) -> JobResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.to_string()),
        ("type", job.job_type.as_str().to_string()),
        ("status", job.status.as_str().to_string()),
        ("priority", job.priority.as_str().to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("metadata", serde_json::to_string(&job.metadata)?),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("progress", job.progress.to_string()),
        ("created_at", format_time(job.created_at)),
        ("timeout_ms", job.timeout_ms.to_string()),
    ];

    if let Some(message) = &job.progress_message {
        fields.push(("progress_message", message.clone()));
    }
    if let Some(error) = &job.error {
        fields.push(("error", error.clone()));
    }
    if let Some(result) = &job.result {
        fields.push(("result", serde_json::to_string(result)?));
    }

    let timestamps = [
        ("processed_at", job.processed_at),
        ("completed_at", job.completed_at),
        ("failed_at", job.failed_at),
        ("cancelled_at", job.cancelled_at),
        ("next_run_at", job.next_run_at),
    ];
    for (name, at) in timestamps {
        if let Some(at) = at {
            fields.push((name, format_time(at)));
        }
    }

    Ok(fields)
}

/// Rebuilds a job from its hash fields.
pub(crate) fn decode_job(mut fields: HashMap<String, String>) -> JobResult<Job> {
    fn required(fields: &mut HashMap<String, String>, name: &str) -> JobResult<String> {
        fields
            .remove(name)
            .ok_or_else(|| JobError::Store(format!("Job hash is missing field {}", name)))
    }

    fn number<T: std::str::FromStr>(fields: &mut HashMap<String, String>, name: &str) -> JobResult<T> {
        let raw = required(fields, name)?;
        raw.parse()
            .map_err(|_| JobError::Store(format!("Invalid number in field {}: {}", name, raw)))
    }

    fn time(fields: &mut HashMap<String, String>, name: &str) -> JobResult<Option<DateTime<Utc>>> {
        fields.remove(name).map(|raw| parse_time(name, &raw)).transpose()
    }

    let result = match fields.remove("result") {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    Ok(Job {
        id: JobId::from_string(required(&mut fields, "id")?),
        job_type: required(&mut fields, "type")?.parse()?,
        priority: required(&mut fields, "priority")?.parse()?,
        payload: serde_json::from_str(&required(&mut fields, "payload")?)?,
        metadata: match fields.remove("metadata") {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        },
        status: required(&mut fields, "status")?.parse()?,
        attempts: number(&mut fields, "attempts")?,
        max_attempts: number(&mut fields, "max_attempts")?,
        progress: number(&mut fields, "progress")?,
        progress_message: fields.remove("progress_message"),
        result,
        error: fields.remove("error"),
        created_at: parse_time("created_at", &required(&mut fields, "created_at")?)?,
        processed_at: time(&mut fields, "processed_at")?,
        completed_at: time(&mut fields, "completed_at")?,
        failed_at: time(&mut fields, "failed_at")?,
        cancelled_at: time(&mut fields, "cancelled_at")?,
        next_run_at: time(&mut fields, "next_run_at")?,
        timeout_ms: number(&mut fields, "timeout_ms")?,
        seq: number(&mut fields, "seq")?,
        version: number(&mut fields, "version")?,
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, mut job: Job) -> JobResult<Job> {
        let fields = encode_job(&job)?;
        let mut conn = self.conn().await?;

        let mut invocation = self.insert_script.prepare_invoke();
        invocation
            .key(self.keys.seq())
            .key(self.keys.job(job.id.as_str()))
            .key(self.keys.pending(job.job_type))
            .key(self.keys.status(job.status))
            .arg(Self::priority_base(job.priority))
            .arg(job.id.as_str())
            .arg(if job.status == JobStatus::Pending { "1" } else { "0" });
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }

        let seq: u64 = invocation.invoke_async(&mut *conn).await?;
        job.seq = seq;
        job.version = 1;

        debug!(job_id = %job.id, seq, priority = %job.priority, "Stored job");
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.keys.job(id.as_str())).await?;

        if fields.is_empty() {
            Ok(None)
        } else {
            decode_job(fields).map(Some)
        }
    }

    async fn compare_and_swap(&self, job: &Job) -> JobResult<Option<Job>> {
        let fields = encode_job(job)?;
        let mut conn = self.conn().await?;

        let retry_due = job.next_run_at.map(|at| at.timestamp_millis()).unwrap_or(0);
        let finished = job.finished_at().map(|at| at.timestamp_millis()).unwrap_or(0);

        let mut invocation = self.replace_script.prepare_invoke();
        invocation
            .key(self.keys.job(job.id.as_str()))
            .key(self.keys.pending(job.job_type))
            .key(self.keys.retrying())
            .key(self.keys.finished())
            .arg(job.version)
            .arg(job.id.as_str())
            .arg(job.status.as_str())
            .arg(Self::priority_base(job.priority))
            .arg(retry_due)
            .arg(finished)
            .arg(self.keys.status_prefix());
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }

        let version: u64 = invocation.invoke_async(&mut *conn).await?;
        if version == 0 {
            debug!(job_id = %job.id, expected = job.version, "Version conflict");
            return Ok(None);
        }

        let mut stored = job.clone();
        stored.version = version;
        Ok(Some(stored))
    }

    async fn pending_candidates(&self, quotas: &[(JobType, usize)]) -> JobResult<Vec<Job>> {
        let quotas: Vec<(JobType, usize)> = quotas.iter().copied().filter(|(_, quota)| *quota > 0).collect();
        if quotas.is_empty() {
            return Ok(Vec::new());
        }

        let heads: Vec<Vec<(String, f64)>> = {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            for (job_type, quota) in &quotas {
                pipe.zrange_withscores(self.keys.pending(*job_type), 0, *quota as isize - 1);
            }
            pipe.query_async(&mut *conn).await?
        };

        let mut merged: Vec<(String, f64)> = heads.into_iter().flatten().collect();
        merged.sort_by(|(_, a), (_, b)| a.total_cmp(b));
        let ids: Vec<String> = merged.into_iter().map(|(id, _)| id).collect();

        let mut jobs = self.fetch_many(&ids).await?;
        jobs.retain(|job| job.status == JobStatus::Pending);
        Ok(jobs)
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>> {
        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.zrangebyscore_limit(self.keys.retrying(), "-inf", now.timestamp_millis(), 0, limit as isize)
                .await?
        };

        let mut jobs = self.fetch_many(&ids).await?;
        jobs.retain(|job| job.status == JobStatus::Retrying);
        Ok(jobs)
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> JobResult<Vec<Job>> {
        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.smembers(self.keys.status(status)).await?
        };

        let mut jobs = self.fetch_many(&ids).await?;
        jobs.retain(|job| job.status == status);
        jobs.sort_by_key(|job| job.seq);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn count_by_status(&self) -> JobResult<HashMap<JobStatus, u64>> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for status in JobStatus::ALL {
            pipe.scard(self.keys.status(status));
        }
        let counts: Vec<u64> = pipe.query_async(&mut *conn).await?;

        Ok(JobStatus::ALL.into_iter().zip(counts).collect())
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.finished(), "-inf", format!("({}", before.timestamp_millis()))
            .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.del(self.keys.job(id)).ignore();
            for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
                pipe.srem(self.keys.status(status), id).ignore();
            }
        }
        pipe.zrem(self.keys.finished(), &ids).ignore();
        let _: () = pipe.query_async(&mut *conn).await?;

        info!(count = ids.len(), "Purged finished jobs");
        Ok(ids.len() as u64)
    }

    async fn ping(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}
