//! Durable job storage.
//!
//! Every mutation after insert goes through [`JobStore::compare_and_swap`],
//! which only succeeds when the stored version matches the caller's copy.
//! That is what lets several queue instances share one store without two of
//! them claiming the same job.

mod memory;
pub mod redis;

pub use memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::JobResult;
use crate::job::{Job, JobId, JobType};
use crate::status::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Persistence capability required by the queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job, assigning `seq` and `version`. Returns the stored copy.
    async fn insert(&self, job: Job) -> JobResult<Job>;

    /// Loads a job.
    async fn get(&self, id: &JobId) -> JobResult<Option<Job>>;

    /// Replaces the stored job if its version still equals `job.version`.
    ///
    /// Returns the stored copy with the bumped version, or `None` when the
    /// job changed (or vanished) since it was read.
    async fn compare_and_swap(&self, job: &Job) -> JobResult<Option<Job>>;

    /// Pending jobs of the listed types, at most `quota` of each, merged in
    /// priority order (highest first), then by `seq`.
    ///
    /// Types missing from `quotas` are not read at all, so a backlog of a
    /// saturated type cannot hide jobs of other types.
    async fn pending_candidates(&self, quotas: &[(JobType, usize)]) -> JobResult<Vec<Job>>;

    /// Retrying jobs whose `next_run_at` is at or before `now`.
    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>>;

    /// Jobs in the given status, oldest first.
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> JobResult<Vec<Job>>;

    /// Number of jobs per status.
    async fn count_by_status(&self) -> JobResult<HashMap<JobStatus, u64>>;

    /// Deletes terminal jobs that finished before `before`. Returns how many.
    async fn purge_finished(&self, before: DateTime<Utc>) -> JobResult<u64>;

    /// Checks that the store is reachable.
    async fn ping(&self) -> JobResult<()>;
}

/// Builds the store selected by configuration.
pub async fn create_store(config: &StoreConfig) -> JobResult<Arc<dyn JobStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreBackend::Redis => {
            let pool = self::redis::create_pool(&config.redis).await?;
            Ok(Arc::new(RedisJobStore::new(pool, &config.redis.key_prefix)))
        }
    }
}
