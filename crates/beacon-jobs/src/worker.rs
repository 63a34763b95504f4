//! Execution of one claimed attempt.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext};
use crate::metrics::{JobMetrics, QueueMetrics};
use crate::progress::JobEvent;
use crate::queue::{JobQueue, Modification};
use crate::scheduler::{self, SlotPermit};
use crate::status::JobStatus;
use beacon_core::Retryable;
use beacon_resilience::with_timeout;
use chrono::Utc;
use serde_json::Value;
use std::any::Any;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Runs a claimed job on its own task. The permit is held until the outcome
/// is recorded.
pub(crate) fn spawn(queue: JobQueue, job: Job, permit: SlotPermit) {
    let span = info_span!(
        "job",
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts
    );
    tokio::spawn(execute(queue, job, permit).instrument(span));
}

async fn execute(queue: JobQueue, job: Job, permit: SlotPermit) {
    let inner = &queue.inner;
    let job_type = job.job_type.as_str();

    let token = inner.shutdown.child_token();
    inner.running.lock().insert(job.id.clone(), token.clone());
    QueueMetrics::set_in_flight(inner.slots.in_flight());

    let wait = job
        .processed_at
        .and_then(|at| (at - job.created_at).to_std().ok())
        .unwrap_or_default();
    JobMetrics::job_started(job_type, job.attempts, wait);
    info!(max_attempts = job.max_attempts, priority = %job.priority, "Processing job");
    inner.events.publish(JobEvent::status(&job));

    let ctx = JobContext::new(&job, token, queue.clone());
    let started = Instant::now();
    let outcome = run_attempt(&queue, &job, ctx).await;
    let elapsed = started.elapsed();

    inner.running.lock().remove(&job.id);
    inner.stats.record(elapsed, outcome.is_ok());

    if let Err(e) = settle(&queue, &job, outcome, elapsed).await {
        // The job stays processing; maintenance recovers it once stale.
        error!(error = %e, "Failed to record job outcome");
    }

    drop(permit);
    QueueMetrics::set_in_flight(inner.slots.in_flight());
}

/// Invokes the processor on a separate task so a panic is contained.
async fn run_attempt(queue: &JobQueue, job: &Job, ctx: JobContext) -> JobResult<Value> {
    let registry = queue.inner.registry.clone();
    let attempt = job.clone();
    let timeout = job.timeout();

    let handle = tokio::spawn(
        async move { with_timeout(timeout, || registry.dispatch(&attempt, ctx)).await }.in_current_span(),
    );

    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(JobError::Panicked(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Records the outcome of an attempt.
///
/// The outcome is discarded if the job left `processing` meanwhile, e.g.
/// because it was cancelled or recovered by maintenance.
async fn settle(queue: &JobQueue, job: &Job, outcome: JobResult<Value>, elapsed: Duration) -> JobResult<()> {
    let inner = &queue.inner;
    let job_type = job.job_type.as_str();
    let shutting_down = inner.shutdown.is_cancelled();

    if matches!(outcome, Err(JobError::Timeout(_))) {
        JobMetrics::job_timed_out(job_type);
    }

    let modification = queue
        .modify(&job.id, |current| {
            if current.status != JobStatus::Processing || current.attempts != job.attempts {
                return Ok(false);
            }

            let now = Utc::now();
            match &outcome {
                Ok(value) => current.complete(value.clone(), now)?,
                Err(err) if current.has_attempts_left() && (err.is_retryable() || interrupted(err, shutting_down)) => {
                    let delay = if shutting_down {
                        Duration::ZERO
                    } else {
                        retry_delay(queue, current, err)
                    };
                    let run_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    current.schedule_retry(err.to_string(), run_at, now)?;
                }
                Err(err) => current.fail(err.to_string(), now)?,
            }
            Ok(true)
        })
        .await?;

    let saved = match modification {
        Modification::Updated(saved) => saved,
        Modification::Unchanged(current) => {
            debug!(status = %current.status, "Discarding outcome, job is no longer processing");
            return Ok(());
        }
        Modification::Missing => {
            warn!("Discarding outcome, job no longer exists");
            return Ok(());
        }
    };

    let duration_ms = elapsed.as_millis() as u64;
    match (&outcome, saved.status) {
        (_, JobStatus::Completed) => {
            JobMetrics::job_completed(job_type, elapsed);
            info!(duration_ms, "Job completed");
        }
        (Err(err), JobStatus::Retrying) => {
            let delay = saved
                .next_run_at
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or_default();
            JobMetrics::job_retried(job_type, err.kind(), elapsed);
            warn!(
                error = %err,
                attempts = saved.attempts,
                max_attempts = saved.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                "Job failed, will retry"
            );
            scheduler::wake_after(queue, delay);
        }
        (Err(err), JobStatus::Failed) => {
            JobMetrics::job_failed(job_type, err.kind(), elapsed);
            error!(error = %err, attempts = saved.attempts, duration_ms, "Job failed");
        }
        (_, status) => {
            debug!(status = %status, "Job settled");
        }
    }

    inner.events.publish(JobEvent::status(&saved));
    Ok(())
}

/// A processor that stopped because the queue is shutting down gets its
/// attempt back on the next start.
fn interrupted(err: &JobError, shutting_down: bool) -> bool {
    shutting_down && matches!(err, JobError::Cancelled)
}

/// Delay before the next attempt: the registered (or configured) backoff,
/// but never shorter than a breaker's requested wait.
fn retry_delay(queue: &JobQueue, job: &Job, err: &JobError) -> Duration {
    let backoff = queue
        .inner
        .registry
        .registration(job.job_type)
        .and_then(|r| r.backoff())
        .unwrap_or(&queue.inner.config.retry.backoff);

    let delay = backoff.delay_for_attempt(job.attempts);
    match err.retry_after() {
        Some(retry_after) => delay.max(retry_after),
        None => delay,
    }
}
