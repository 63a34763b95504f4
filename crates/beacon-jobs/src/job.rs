//! Job record, job types, and the execution context handed to processors.

use crate::error::{JobError, JobResult};
use crate::queue::{JobQueue, Priority};
use crate::status::JobStatus;
use beacon_resilience::RetryExecutor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Closed set of job categories.
///
/// The type selects the processor and the concurrency bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SeoAnalysis,
    CompetitiveAnalysis,
    ContentScoring,
    KeywordResearch,
    EmailNotification,
    DataSync,
    Demo,
}

impl JobType {
    /// Every job type.
    pub const ALL: [JobType; 7] = [
        JobType::SeoAnalysis,
        JobType::CompetitiveAnalysis,
        JobType::ContentScoring,
        JobType::KeywordResearch,
        JobType::EmailNotification,
        JobType::DataSync,
        JobType::Demo,
    ];

    /// Returns the wire name of the job type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobType::SeoAnalysis => "seo_analysis",
            JobType::CompetitiveAnalysis => "competitive_analysis",
            JobType::ContentScoring => "content_scoring",
            JobType::KeywordResearch => "keyword_research",
            JobType::EmailNotification => "email_notification",
            JobType::DataSync => "data_sync",
            JobType::Demo => "demo",
        }
    }

    /// Concurrency ceiling used when neither configuration nor registration
    /// sets one. Analysis types crawl and call inference APIs, so they run
    /// fewer at a time than lightweight types.
    pub const fn default_concurrency(&self) -> usize {
        match self {
            JobType::SeoAnalysis | JobType::CompetitiveAnalysis => 2,
            JobType::ContentScoring | JobType::KeywordResearch => 3,
            JobType::DataSync => 5,
            JobType::EmailNotification | JobType::Demo => 10,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::UnknownJobType(s.to_string()))
    }
}

/// Durable record of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Job category.
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Scheduling priority.
    pub priority: Priority,

    /// Processor input, opaque to the queue.
    pub payload: Value,

    /// Caller-supplied metadata, opaque to the queue.
    #[serde(default)]
    pub metadata: Value,

    /// Current status.
    pub status: JobStatus,

    /// Attempts started so far.
    pub attempts: u32,

    /// Attempt ceiling, fixed at submission.
    pub max_attempts: u32,

    /// Progress percentage (0-100).
    pub progress: u8,

    /// Optional progress message.
    pub progress_message: Option<String>,

    /// Processor output, set on completion.
    pub result: Option<Value>,

    /// Last error message.
    pub error: Option<String>,

    /// When the job was submitted.
    pub created_at: DateTime<Utc>,

    /// When the latest attempt started.
    pub processed_at: Option<DateTime<Utc>>,

    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,

    /// When the job failed.
    pub failed_at: Option<DateTime<Utc>>,

    /// When the job was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,

    /// When a retrying job becomes due.
    pub next_run_at: Option<DateTime<Utc>>,

    /// Invocation timeout in milliseconds.
    pub timeout_ms: u64,

    /// Insertion sequence assigned by the store; FIFO tie breaker.
    pub seq: u64,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: u64,
}

impl Job {
    /// Creates a pending job. The store assigns `seq` and `version` on insert.
    pub fn new(job_type: JobType, payload: Value, priority: Priority, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            priority,
            payload,
            metadata: Value::Null,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            progress: 0,
            progress_message: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            next_run_at: None,
            timeout_ms: timeout.as_millis() as u64,
            seq: 0,
            version: 0,
        }
    }

    /// Sets the metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns the invocation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns true if the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if another attempt may start.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Moves the job to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> JobResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            JobStatus::Pending => self.next_run_at = None,
            JobStatus::Processing => self.processed_at = Some(now),
            JobStatus::Retrying => {}
            JobStatus::Completed => self.completed_at = Some(now),
            JobStatus::Failed => self.failed_at = Some(now),
            JobStatus::Cancelled => {
                self.cancelled_at = Some(now);
                self.next_run_at = None;
            }
        }

        self.status = next;
        Ok(())
    }

    /// Claims the job for a new attempt (`pending → processing`).
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        if !self.has_attempts_left() {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        self.transition(JobStatus::Processing, now)?;
        self.attempts += 1;
        self.progress = 0;
        self.progress_message = None;
        Ok(())
    }

    /// Records a successful attempt.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Completed, now)?;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Records a failed attempt that will be retried at `run_at`.
    pub fn schedule_retry(&mut self, error: String, run_at: DateTime<Utc>, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Retrying, now)?;
        self.error = Some(error);
        self.next_run_at = Some(run_at);
        Ok(())
    }

    /// Records a failed attempt that ends the job.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Failed, now)?;
        self.error = Some(error);
        self.result = None;
        Ok(())
    }

    /// Returns a retrying job to the pending set (`retrying → pending`).
    pub fn requeue(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Pending, now)
    }

    /// Cancels a non-terminal job.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Cancelled, now)
    }

    /// Returns the finishing timestamp of a terminal job.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Completed => self.completed_at,
            JobStatus::Failed => self.failed_at,
            JobStatus::Cancelled => self.cancelled_at,
            _ => None,
        }
    }

    /// Returns the caller-facing status view.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id.clone(),
            job_type: self.job_type,
            status: self.status,
            progress: self.progress,
            progress_message: self.progress_message.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            timestamps: JobTimestamps {
                created_at: self.created_at,
                processed_at: self.processed_at,
                completed_at: self.completed_at,
                failed_at: self.failed_at,
                cancelled_at: self.cancelled_at,
            },
        }
    }
}

/// Lifecycle timestamps exposed by the status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Status of a job as seen by submitters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timestamps: JobTimestamps,
}

/// Execution context handed to a processor for one attempt.
#[derive(Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Job type.
    pub job_type: JobType,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// Caller-supplied metadata.
    pub metadata: Value,

    /// Fires when the job is cancelled or the queue shuts down.
    pub cancellation_token: CancellationToken,

    executor: RetryExecutor,
    queue: Option<JobQueue>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl JobContext {
    pub(crate) fn new(job: &Job, cancellation_token: CancellationToken, queue: JobQueue) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            metadata: job.metadata.clone(),
            cancellation_token,
            executor: queue.executor().clone(),
            queue: Some(queue),
        }
    }

    /// Creates a context that is not attached to a queue.
    ///
    /// Progress updates are dropped. Useful for exercising processors in
    /// isolation.
    pub fn detached(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            metadata: job.metadata.clone(),
            cancellation_token: CancellationToken::new(),
            executor: RetryExecutor::default(),
            queue: None,
        }
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Check if cancellation has been requested.
    ///
    /// Long-running processors should check this between steps and return
    /// `JobError::Cancelled` when it is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Retry executor sharing the queue's circuit breakers, for wrapping
    /// calls to downstream services.
    pub fn resilience(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Reports progress for this job.
    pub async fn update_progress(&self, percent: i32, message: Option<String>) -> JobResult<()> {
        match &self.queue {
            Some(queue) => queue.update_progress(&self.job_id, percent, message).await,
            None => Ok(()),
        }
    }
}
