//! In-memory job store.

use super::JobStore;
use crate::error::JobResult;
use crate::job::{Job, JobId, JobType};
use crate::status::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Process-local store for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    /// Per type: (priority descending, seq ascending) -> pending job.
    pending: HashMap<JobType, BTreeMap<PendingKey, JobId>>,
    next_seq: u64,
}

type PendingKey = (Reverse<i8>, u64);

impl MemoryState {
    fn index_key(job: &Job) -> PendingKey {
        (Reverse(job.priority.value()), job.seq)
    }

    fn index_pending(&mut self, job: &Job) {
        self.pending
            .entry(job.job_type)
            .or_default()
            .insert(Self::index_key(job), job.id.clone());
    }

    fn unindex_pending(&mut self, job_type: JobType, key: &PendingKey) {
        if let Some(index) = self.pending.get_mut(&job_type) {
            index.remove(key);
        }
    }
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    /// Returns true if no jobs are stored.
    pub fn is_empty(&self) -> bool {
        self.state.read().jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, mut job: Job) -> JobResult<Job> {
        let mut state = self.state.write();
        state.next_seq += 1;
        job.seq = state.next_seq;
        job.version = 1;

        if job.status == JobStatus::Pending {
            state.index_pending(&job);
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<Job>> {
        Ok(self.state.read().jobs.get(id).cloned())
    }

    async fn compare_and_swap(&self, job: &Job) -> JobResult<Option<Job>> {
        let mut state = self.state.write();

        let indexed = match state.jobs.get(&job.id) {
            Some(current) if current.version == job.version => (current.status == JobStatus::Pending)
                .then(|| (current.job_type, MemoryState::index_key(current))),
            _ => return Ok(None),
        };

        let mut stored = job.clone();
        stored.version = job.version + 1;

        if let Some((job_type, key)) = indexed {
            state.unindex_pending(job_type, &key);
        }
        if stored.status == JobStatus::Pending {
            state.index_pending(&stored);
        }
        state.jobs.insert(stored.id.clone(), stored.clone());
        Ok(Some(stored))
    }

    async fn pending_candidates(&self, quotas: &[(JobType, usize)]) -> JobResult<Vec<Job>> {
        let state = self.state.read();
        let mut heads: Vec<(PendingKey, &JobId)> = quotas
            .iter()
            .filter_map(|(job_type, quota)| state.pending.get(job_type).map(|index| (index, *quota)))
            .flat_map(|(index, quota)| index.iter().take(quota).map(|(key, id)| (*key, id)))
            .collect();
        heads.sort_unstable_by_key(|(key, _)| *key);

        Ok(heads
            .into_iter()
            .filter_map(|(_, id)| state.jobs.get(id).cloned())
            .collect())
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> JobResult<Vec<Job>> {
        let state = self.state.read();
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Retrying && job.next_run_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_status(&self, status: JobStatus, limit: usize) -> JobResult<Vec<Job>> {
        let state = self.state.read();
        let mut jobs: Vec<Job> = state.jobs.values().filter(|job| job.status == status).cloned().collect();
        jobs.sort_by_key(|job| job.seq);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn count_by_status(&self) -> JobResult<HashMap<JobStatus, u64>> {
        let state = self.state.read();
        let mut counts: HashMap<JobStatus, u64> = JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for job in state.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> JobResult<u64> {
        let mut state = self.state.write();
        let before_len = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.is_terminal() && job.finished_at().is_some_and(|at| at < before)));
        Ok((before_len - state.jobs.len()) as u64)
    }

    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }
}
