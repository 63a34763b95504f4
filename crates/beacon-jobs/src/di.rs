//! Dependency injection interfaces for the jobs module.
//!
//! Provides a Shaku-compatible interface over the queue for callers that
//! should not depend on the engine type.

use crate::error::JobResult;
use crate::health::{HealthReport, HealthReporter};
use crate::job::{JobId, JobStatusView};
use crate::progress::JobSubscription;
use crate::queue::{JobQueue, QueueDepth};
use async_trait::async_trait;
use beacon_core::Interface;
use serde_json::Value;

/// Caller-facing job operations.
#[async_trait]
pub trait JobService: Interface + Send + Sync {
    /// Submit a job by wire names. Returns its ID.
    async fn submit(
        &self,
        job_type: &str,
        payload: Value,
        priority: Option<&str>,
        metadata: Option<Value>,
    ) -> JobResult<JobId>;

    /// Status of a job, `None` if unknown.
    async fn get_status(&self, job_id: &JobId) -> JobResult<Option<JobStatusView>>;

    /// Cancel a job. False if it was already finished or unknown.
    async fn cancel(&self, job_id: &JobId) -> JobResult<bool>;

    /// Progress and status events of a job. A finished job yields its final
    /// status and ends.
    async fn subscribe(&self, job_id: &JobId) -> JobResult<JobSubscription>;

    /// Job counts by status.
    async fn queue_depth(&self) -> JobResult<QueueDepth>;

    /// Fresh health report.
    async fn health(&self) -> HealthReport;
}

/// Job service backed by the queue engine.
pub struct JobQueueService {
    queue: JobQueue,
    health: HealthReporter,
}

impl JobQueueService {
    /// Create a new job service.
    pub fn new(queue: JobQueue, health: HealthReporter) -> Self {
        Self { queue, health }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

#[async_trait]
impl JobService for JobQueueService {
    async fn submit(
        &self,
        job_type: &str,
        payload: Value,
        priority: Option<&str>,
        metadata: Option<Value>,
    ) -> JobResult<JobId> {
        self.queue.submit_raw(job_type, payload, priority, metadata).await
    }

    async fn get_status(&self, job_id: &JobId) -> JobResult<Option<JobStatusView>> {
        Ok(self.queue.get_status(job_id).await?.map(|job| job.status_view()))
    }

    async fn cancel(&self, job_id: &JobId) -> JobResult<bool> {
        self.queue.cancel(job_id).await
    }

    async fn subscribe(&self, job_id: &JobId) -> JobResult<JobSubscription> {
        self.queue.subscribe(job_id).await
    }

    async fn queue_depth(&self) -> JobResult<QueueDepth> {
        self.queue.queue_depth().await
    }

    async fn health(&self) -> HealthReport {
        self.health.check().await
    }
}
