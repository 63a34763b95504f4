//! Queue engine: submission, status, cancellation and lifecycle.

use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobStatusView, JobType};
use crate::maintenance::{self, MaintenanceReport};
use crate::metrics::{ExecutionStats, ExecutionSummary, JobMetrics};
use crate::progress::{JobEvent, JobSubscription, ProgressHub};
use crate::registry::ProcessorRegistry;
use crate::scheduler::{self, SlotTracker};
use crate::status::JobStatus;
use beacon_resilience::{with_timeout, CircuitBreakerRegistry, RetryExecutor};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::store::JobStore;

/// Job priority levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i8)]
pub enum Priority {
    /// Low priority (background tasks).
    Low = -10,
    /// Normal priority (default).
    #[default]
    Normal = 0,
    /// High priority (important tasks).
    High = 10,
    /// Critical priority (time-sensitive).
    Critical = 20,
}

impl Priority {
    /// Numeric weight; higher dispatches first.
    pub const fn value(self) -> i8 {
        self as i8
    }

    /// Returns the wire name of the priority.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(JobError::Validation(format!("Unknown priority: {}", other))),
        }
    }
}

impl From<i8> for Priority {
    fn from(value: i8) -> Self {
        match value {
            v if v >= 20 => Priority::Critical,
            v if v >= 10 => Priority::High,
            v if v <= -10 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl From<Priority> for i8 {
    fn from(priority: Priority) -> Self {
        priority as i8
    }
}

/// Options for [`JobQueue::submit_with`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    priority: Priority,
    metadata: Option<Value>,
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
}

impl SubmitOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach caller metadata.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the attempt ceiling.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueDepth {
    fn from_counts(counts: &HashMap<JobStatus, u64>) -> Self {
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            pending: count(JobStatus::Pending),
            processing: count(JobStatus::Processing),
            retrying: count(JobStatus::Retrying),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
        }
    }

    /// Count for one status.
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Retrying => self.retrying,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    /// Jobs not yet finished.
    pub fn active(&self) -> u64 {
        self.pending + self.processing + self.retrying
    }
}

/// Result of a read-modify-write against the store.
pub(crate) enum Modification {
    Missing,
    Unchanged(Job),
    Updated(Job),
}

const MAX_CAS_ATTEMPTS: usize = 16;

pub(crate) struct QueueInner {
    pub(crate) config: JobsConfig,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: Arc<ProcessorRegistry>,
    pub(crate) executor: RetryExecutor,
    pub(crate) slots: Arc<SlotTracker>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) events: ProgressHub,
    pub(crate) running: Mutex<HashMap<JobId, CancellationToken>>,
    pub(crate) stats: ExecutionStats,
    pub(crate) store_available: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The queue engine.
///
/// A cheap-to-clone handle; all clones drive the same scheduler. Construct
/// one per process with [`JobQueue::new`], call [`start`](Self::start) once
/// processors are registered, and [`shutdown`](Self::shutdown) on exit.
#[derive(Clone)]
pub struct JobQueue {
    pub(crate) inner: Arc<QueueInner>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("global_concurrency", &self.inner.config.queue.global_concurrency)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl JobQueue {
    /// Creates a queue over `store` dispatching to `registry`.
    pub fn new(config: JobsConfig, store: Arc<dyn JobStore>, registry: ProcessorRegistry) -> JobResult<Self> {
        if config.queue.global_concurrency == 0 {
            return Err(JobError::Configuration(
                "queue.global_concurrency must be at least 1".to_string(),
            ));
        }

        let mut limits = HashMap::new();
        for job_type in JobType::ALL {
            let limit = config
                .queue
                .type_concurrency
                .get(&job_type)
                .copied()
                .or_else(|| registry.registration(job_type).and_then(|r| r.concurrency()))
                .unwrap_or_else(|| job_type.default_concurrency());
            if limit == 0 {
                return Err(JobError::Configuration(format!(
                    "Concurrency for job type {} must be at least 1",
                    job_type
                )));
            }
            limits.insert(job_type, limit);
        }

        let wake = Arc::new(Notify::new());
        let slots = Arc::new(SlotTracker::new(config.queue.global_concurrency, limits, wake.clone()));
        let executor = RetryExecutor::new(registry.breakers().clone());
        let events = ProgressHub::new(config.queue.event_capacity);
        let stats = ExecutionStats::new(config.health.window());

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                registry: Arc::new(registry),
                executor,
                slots,
                wake,
                events,
                running: Mutex::new(HashMap::new()),
                stats,
                store_available: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submits a job and returns its ID.
    pub async fn submit(
        &self,
        job_type: JobType,
        payload: Value,
        priority: Priority,
        metadata: Option<Value>,
    ) -> JobResult<JobId> {
        let mut options = SubmitOptions::new().priority(priority);
        if let Some(metadata) = metadata {
            options = options.metadata(metadata);
        }
        self.submit_with(job_type, payload, options).await
    }

    /// Submits a job identified by wire names.
    ///
    /// A missing priority means `normal`.
    pub async fn submit_raw(
        &self,
        job_type: &str,
        payload: Value,
        priority: Option<&str>,
        metadata: Option<Value>,
    ) -> JobResult<JobId> {
        let job_type: JobType = job_type.parse()?;
        let priority: Priority = priority.map(str::parse).transpose()?.unwrap_or_default();
        self.submit(job_type, payload, priority, metadata).await
    }

    /// Submits a job with explicit options.
    pub async fn submit_with(&self, job_type: JobType, payload: Value, options: SubmitOptions) -> JobResult<JobId> {
        let registration = self
            .inner
            .registry
            .registration(job_type)
            .ok_or_else(|| JobError::UnknownJobType(job_type.to_string()))?;
        registration.validate(&payload)?;

        if options.max_attempts == Some(0) {
            return Err(JobError::Validation("max_attempts must be at least 1".to_string()));
        }

        let max_attempts = options
            .max_attempts
            .or(registration.max_attempts())
            .unwrap_or(self.inner.config.retry.max_attempts)
            .max(1);
        let timeout = options
            .timeout
            .or(registration.timeout())
            .unwrap_or_else(|| self.inner.config.queue.default_timeout());

        let job = Job::new(job_type, payload, options.priority, max_attempts, timeout)
            .with_metadata(options.metadata.unwrap_or(Value::Null));
        let job = self.store_call(|| self.inner.store.insert(job.clone())).await?;

        JobMetrics::job_submitted(job.job_type.as_str(), job.priority.as_str());
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            max_attempts = job.max_attempts,
            "Job submitted"
        );

        self.inner.events.publish(JobEvent::status(&job));
        self.inner.wake.notify_one();
        Ok(job.id)
    }

    // ------------------------------------------------------------------
    // Status & control
    // ------------------------------------------------------------------

    /// Loads a job.
    pub async fn get_status(&self, job_id: &JobId) -> JobResult<Option<Job>> {
        self.store_call(|| self.inner.store.get(job_id)).await
    }

    /// Returns the caller-facing status of a job.
    pub async fn status_view(&self, job_id: &JobId) -> JobResult<JobStatusView> {
        self.get_status(job_id)
            .await?
            .map(|job| job.status_view())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Cancels a job that has not finished.
    ///
    /// Returns false for finished or unknown jobs. A running processor is
    /// signalled through its cancellation token but not interrupted.
    pub async fn cancel(&self, job_id: &JobId) -> JobResult<bool> {
        let now = Utc::now();
        let outcome = self
            .modify(job_id, |job| {
                if job.is_terminal() {
                    return Ok(false);
                }
                job.cancel(now)?;
                Ok(true)
            })
            .await?;

        match outcome {
            Modification::Updated(job) => {
                if let Some(token) = self.inner.running.lock().get(job_id) {
                    token.cancel();
                }
                JobMetrics::job_cancelled(job.job_type.as_str());
                self.inner.events.publish(JobEvent::status(&job));
                info!(job_id = %job_id, attempts = job.attempts, "Job cancelled");
                Ok(true)
            }
            Modification::Unchanged(job) => {
                debug!(job_id = %job_id, status = %job.status, "Cancel ignored for finished job");
                Ok(false)
            }
            Modification::Missing => {
                debug!(job_id = %job_id, "Cancel ignored for unknown job");
                Ok(false)
            }
        }
    }

    /// Records processor progress, clamped to 0..=100.
    ///
    /// Fails with [`JobError::Cancelled`] once the job has been cancelled, so
    /// a processor can stop early.
    pub async fn update_progress(&self, job_id: &JobId, percent: i32, message: Option<String>) -> JobResult<()> {
        let progress = percent.clamp(0, 100) as u8;

        let outcome = self
            .modify(job_id, |job| match job.status {
                JobStatus::Processing => {
                    job.progress = progress;
                    job.progress_message = message.clone();
                    Ok(true)
                }
                JobStatus::Cancelled => Err(JobError::Cancelled),
                other => Err(JobError::Validation(format!(
                    "Progress can only be reported while processing, job {} is {}",
                    job.id, other
                ))),
            })
            .await?;

        match outcome {
            Modification::Updated(job) => {
                debug!(job_id = %job_id, progress, "Progress updated");
                self.inner.events.publish(JobEvent::Progress {
                    job_id: job.id,
                    progress,
                    message: job.progress_message,
                });
                Ok(())
            }
            Modification::Unchanged(_) => Ok(()),
            Modification::Missing => Err(JobError::NotFound(job_id.to_string())),
        }
    }

    /// Subscribes to progress and status events of one job.
    ///
    /// A job that already finished yields its final status once, then the
    /// subscription ends.
    pub async fn subscribe(&self, job_id: &JobId) -> JobResult<JobSubscription> {
        // Listen first so a status change racing the read is not lost.
        let mut subscription = self.inner.events.subscribe(job_id.clone());
        let job = self
            .get_status(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if job.is_terminal() {
            subscription.seed(JobEvent::status(&job));
        }
        Ok(subscription)
    }

    /// Subscribes to events of every job.
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe_all()
    }

    /// Counts jobs by status.
    pub async fn queue_depth(&self) -> JobResult<QueueDepth> {
        let counts = self.store_call(|| self.inner.store.count_by_status()).await?;
        Ok(QueueDepth::from_counts(&counts))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the scheduler loop and the maintenance task.
    pub fn start(&self) -> JobResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::Configuration("Job queue has been shut down".to_string()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Job queue already started".to_string()));
        }

        info!(
            global_concurrency = self.inner.config.queue.global_concurrency,
            job_types = ?self.inner.registry.job_types(),
            "Starting job queue"
        );

        let scheduler = tokio::spawn(
            scheduler::run(self.clone(), self.inner.shutdown.child_token()).instrument(info_span!("scheduler")),
        );
        let maintenance = tokio::spawn(
            maintenance::run(self.clone(), self.inner.shutdown.child_token()).instrument(info_span!("maintenance")),
        );
        self.inner.tasks.lock().extend([scheduler, maintenance]);
        Ok(())
    }

    /// Stops background tasks and waits for in-flight jobs.
    ///
    /// Running processors see their cancellation token fire. Waiting is
    /// bounded by `queue.shutdown_timeout_ms`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down job queue...");
        self.inner.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let drained = tokio::time::timeout(self.inner.config.queue.shutdown_timeout(), self.inner.slots.wait_idle()).await;
        if drained.is_err() {
            warn!(in_flight = self.in_flight(), "Shutdown timeout elapsed with jobs still running");
        }

        info!("Job queue stopped");
    }

    /// Returns true between `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }

    /// Runs stale-job recovery and purging once.
    pub async fn run_maintenance(&self) -> JobResult<MaintenanceReport> {
        maintenance::run_once(self).await
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Jobs currently executing in this process.
    pub fn in_flight(&self) -> usize {
        self.inner.slots.in_flight()
    }

    /// Jobs of one type currently executing in this process.
    pub fn in_flight_for(&self, job_type: JobType) -> usize {
        self.inner.slots.in_flight_for(job_type)
    }

    /// Latency and error rate over the recent window.
    pub fn execution_summary(&self) -> ExecutionSummary {
        self.inner.stats.summary()
    }

    /// Circuit breakers shared by processors and the retry executor.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.inner.registry.breakers()
    }

    /// Retry executor shared with processors.
    pub fn executor(&self) -> &RetryExecutor {
        &self.inner.executor
    }

    /// Processor registry.
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.inner.registry
    }

    /// Queue configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }

    /// Last known store availability as observed by the scheduler.
    pub fn store_available(&self) -> bool {
        self.inner.store_available.load(Ordering::SeqCst)
    }

    /// Pings the store.
    pub async fn ping_store(&self) -> bool {
        match self.store_timed(|| self.inner.store.ping()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Job store ping failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Store helpers
    // ------------------------------------------------------------------

    /// Runs one store operation under the store deadline.
    pub(crate) async fn store_timed<T, F, Fut>(&self, op: F) -> JobResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = JobResult<T>>,
    {
        with_timeout(self.inner.config.queue.store_timeout(), op).await
    }

    /// Runs a store operation under the store retry policy. Every attempt
    /// gets its own deadline; a timed out attempt counts as a retryable
    /// failure.
    pub(crate) async fn store_call<T, F, Fut>(&self, mut op: F) -> JobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JobResult<T>>,
    {
        let deadline = self.inner.config.queue.store_timeout();
        self.inner
            .executor
            .execute_with_retry(&self.inner.config.queue.store_retry, None, || {
                let attempt = op();
                with_timeout(deadline, move || attempt)
            })
            .await
            .map_err(JobError::from)
    }

    /// Read-modify-write of one job with optimistic concurrency.
    ///
    /// `apply` returns false to leave the job untouched. Version conflicts
    /// re-read and re-apply.
    pub(crate) async fn modify<F>(&self, job_id: &JobId, mut apply: F) -> JobResult<Modification>
    where
        F: FnMut(&mut Job) -> JobResult<bool>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut job) = self.store_call(|| self.inner.store.get(job_id)).await? else {
                return Ok(Modification::Missing);
            };

            if !apply(&mut job)? {
                return Ok(Modification::Unchanged(job));
            }

            if let Some(saved) = self.store_call(|| self.inner.store.compare_and_swap(&job)).await? {
                return Ok(Modification::Updated(saved));
            }
            debug!(job_id = %job_id, "Version conflict, re-reading job");
        }

        Err(JobError::Store(format!(
            "Gave up updating job {} after {} version conflicts",
            job_id, MAX_CAS_ATTEMPTS
        )))
    }
}
