//! Periodic housekeeping: stale-job recovery and retention.

use crate::error::JobResult;
use crate::metrics::JobMetrics;
use crate::progress::JobEvent;
use crate::queue::{JobQueue, Modification};
use crate::status::JobStatus;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Stale jobs handed back for another attempt.
    pub recovered: usize,
    /// Stale jobs failed because no attempts were left.
    pub failed: usize,
    /// Finished jobs deleted past retention.
    pub purged: u64,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub(crate) async fn run(queue: JobQueue, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(queue.inner.config.maintenance.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match run_once(&queue).await {
            Ok(report) if !report.is_empty() => info!(
                recovered = report.recovered,
                failed = report.failed,
                purged = report.purged,
                "Maintenance pass finished"
            ),
            Ok(_) => debug!("Maintenance pass found nothing to do"),
            Err(e) => warn!(error = %e, "Maintenance pass failed"),
        }
    }

    debug!("Maintenance task stopped");
}

pub(crate) async fn run_once(queue: &JobQueue) -> JobResult<MaintenanceReport> {
    let mut report = MaintenanceReport::default();
    recover_stale(queue, &mut report).await?;
    report.purged = purge_expired(queue).await?;
    Ok(report)
}

/// Processing jobs that no live worker in this process owns and whose
/// timeout plus grace has passed are assumed orphaned by a crashed instance.
async fn recover_stale(queue: &JobQueue, report: &mut MaintenanceReport) -> JobResult<()> {
    let inner = &queue.inner;
    let grace = chrono::Duration::from_std(inner.config.maintenance.stale_grace())
        .unwrap_or_else(|_| chrono::Duration::zero());
    let limit = inner.config.queue.scan_limit;

    let processing = queue
        .store_call(|| inner.store.list_by_status(JobStatus::Processing, limit))
        .await?;
    let now = Utc::now();

    for job in processing {
        if inner.running.lock().contains_key(&job.id) {
            continue;
        }
        let Some(started) = job.processed_at else {
            continue;
        };
        let timeout = chrono::Duration::from_std(job.timeout()).unwrap_or_else(|_| chrono::Duration::zero());
        if started + timeout + grace > now {
            continue;
        }

        let attempt = job.attempts;
        let outcome = queue
            .modify(&job.id, |current| {
                if current.status != JobStatus::Processing || current.attempts != attempt {
                    return Ok(false);
                }
                let now = Utc::now();
                let error = format!("Attempt {} was abandoned without an outcome", attempt);
                if current.has_attempts_left() {
                    current.schedule_retry(error, now, now)?;
                } else {
                    current.fail(error, now)?;
                }
                Ok(true)
            })
            .await?;

        if let Modification::Updated(saved) = outcome {
            JobMetrics::job_recovered(saved.job_type.as_str());
            if saved.status == JobStatus::Retrying {
                report.recovered += 1;
            } else {
                report.failed += 1;
            }
            warn!(
                job_id = %saved.id,
                job_type = %saved.job_type,
                status = %saved.status,
                attempts = saved.attempts,
                "Recovered stale job"
            );
            inner.events.publish(JobEvent::status(&saved));
        }
    }

    if report.recovered > 0 {
        inner.wake.notify_one();
    }
    Ok(())
}

async fn purge_expired(queue: &JobQueue) -> JobResult<u64> {
    let inner = &queue.inner;
    let retention = chrono::Duration::from_std(inner.config.maintenance.retention())
        .unwrap_or_else(|_| chrono::Duration::zero());
    let cutoff = Utc::now() - retention;

    let purged = queue.store_call(|| inner.store.purge_finished(cutoff)).await?;
    if purged > 0 {
        JobMetrics::jobs_purged(purged);
    }
    Ok(purged)
}
