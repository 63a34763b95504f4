//! Dispatch loop and concurrency slots.

use crate::error::JobResult;
use crate::job::{Job, JobType};
use crate::queue::JobQueue;
use crate::worker;
use beacon_resilience::BackoffPolicy;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Global and per-type execution ceilings for this process.
#[derive(Debug)]
pub(crate) struct SlotTracker {
    global_limit: usize,
    limits: HashMap<JobType, usize>,
    state: Mutex<SlotState>,
    released: Arc<Notify>,
    idle: Notify,
}

#[derive(Debug, Default)]
struct SlotState {
    total: usize,
    per_type: HashMap<JobType, usize>,
}

/// A held execution slot. Dropping it frees the slot and wakes the scheduler.
#[derive(Debug)]
pub(crate) struct SlotPermit {
    tracker: Arc<SlotTracker>,
    job_type: JobType,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.tracker.release(self.job_type);
    }
}

impl SlotTracker {
    pub(crate) fn new(global_limit: usize, limits: HashMap<JobType, usize>, released: Arc<Notify>) -> Self {
        Self {
            global_limit,
            limits,
            state: Mutex::new(SlotState::default()),
            released,
            idle: Notify::new(),
        }
    }

    fn limit_for(&self, job_type: JobType) -> usize {
        self.limits
            .get(&job_type)
            .copied()
            .unwrap_or_else(|| job_type.default_concurrency())
    }

    /// Takes a slot for `job_type` if both ceilings allow it.
    pub(crate) fn try_acquire(self: &Arc<Self>, job_type: JobType) -> Option<SlotPermit> {
        let mut state = self.state.lock();
        let running = state.per_type.get(&job_type).copied().unwrap_or(0);
        if state.total >= self.global_limit || running >= self.limit_for(job_type) {
            return None;
        }

        state.total += 1;
        *state.per_type.entry(job_type).or_default() += 1;
        Some(SlotPermit {
            tracker: self.clone(),
            job_type,
        })
    }

    fn release(&self, job_type: JobType) {
        let now_idle = {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            if let Some(count) = state.per_type.get_mut(&job_type) {
                *count = count.saturating_sub(1);
            }
            state.total == 0
        };

        if now_idle {
            self.idle.notify_waiters();
        }
        self.released.notify_one();
    }

    /// Free slots per type, each capped by the remaining global capacity and
    /// by `cap`. Types at their ceiling are omitted.
    pub(crate) fn open_slots(&self, cap: usize) -> Vec<(JobType, usize)> {
        let state = self.state.lock();
        let global_free = self.global_limit.saturating_sub(state.total).min(cap);
        if global_free == 0 {
            return Vec::new();
        }

        JobType::ALL
            .into_iter()
            .filter_map(|job_type| {
                let running = state.per_type.get(&job_type).copied().unwrap_or(0);
                let free = self.limit_for(job_type).saturating_sub(running).min(global_free);
                (free > 0).then_some((job_type, free))
            })
            .collect()
    }

    pub(crate) fn has_global_capacity(&self) -> bool {
        self.state.lock().total < self.global_limit
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().total
    }

    pub(crate) fn in_flight_for(&self, job_type: JobType) -> usize {
        self.state.lock().per_type.get(&job_type).copied().unwrap_or(0)
    }

    /// Resolves once no slot is held.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Scheduler loop. Runs until `cancel` fires.
///
/// Each round promotes due retries, then reads the head of the pending
/// backlog of every type that still has a free slot and claims those jobs in
/// priority order. While the store is
/// unreachable, dispatch pauses with exponential backoff instead of
/// spinning.
pub(crate) async fn run(queue: JobQueue, cancel: CancellationToken) {
    let poll_interval = queue.inner.config.queue.poll_interval();
    let store_pause = BackoffPolicy::exponential(poll_interval, queue.inner.config.queue.max_store_pause(), 2.0);
    let mut consecutive_failures: u32 = 0;

    info!(poll_interval_ms = poll_interval.as_millis() as u64, "Scheduler started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let pause = match dispatch_round(&queue).await {
            Ok(dispatched) => {
                if consecutive_failures > 0 {
                    info!(consecutive_failures, "Job store reachable again, resuming dispatch");
                    consecutive_failures = 0;
                }
                queue.inner.store_available.store(true, Ordering::SeqCst);

                if dispatched > 0 && queue.inner.slots.has_global_capacity() {
                    // More candidates may be waiting behind the scan limit.
                    tokio::task::yield_now().await;
                    continue;
                }
                None
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                queue.inner.store_available.store(false, Ordering::SeqCst);
                let pause = store_pause.delay_for_attempt(consecutive_failures);
                warn!(
                    error = %e,
                    consecutive_failures,
                    pause_ms = pause.as_millis() as u64,
                    "Dispatch paused, job store unavailable"
                );
                Some(pause)
            }
        };

        match pause {
            Some(pause) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.inner.wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    info!("Scheduler stopped");
}

/// One scheduling pass. Returns how many jobs were dispatched.
async fn dispatch_round(queue: &JobQueue) -> JobResult<usize> {
    let inner = &queue.inner;
    let scan_limit = inner.config.queue.scan_limit;

    promote_due_retries(queue, scan_limit).await?;

    let open = inner.slots.open_slots(scan_limit);
    if open.is_empty() {
        return Ok(0);
    }

    let candidates = queue.store_timed(|| inner.store.pending_candidates(&open)).await?;
    let mut dispatched = 0;

    for candidate in candidates {
        if !inner.slots.has_global_capacity() {
            break;
        }
        let Some(permit) = inner.slots.try_acquire(candidate.job_type) else {
            continue;
        };

        if let Some(job) = claim(queue, candidate).await? {
            worker::spawn(queue.clone(), job, permit);
            dispatched += 1;
        }
    }

    Ok(dispatched)
}

/// Moves retrying jobs whose delay elapsed back to pending.
async fn promote_due_retries(queue: &JobQueue, limit: usize) -> JobResult<()> {
    let store = &queue.inner.store;
    for mut job in queue.store_timed(|| store.due_retries(Utc::now(), limit)).await? {
        if job.requeue(Utc::now()).is_err() {
            continue;
        }
        if queue.store_timed(|| store.compare_and_swap(&job)).await?.is_some() {
            debug!(job_id = %job.id, attempts = job.attempts, "Retry is due, job pending again");
        }
    }
    Ok(())
}

/// Claims a pending job for this instance. `None` means another claimer won.
async fn claim(queue: &JobQueue, mut job: Job) -> JobResult<Option<Job>> {
    if let Err(e) = job.begin_attempt(Utc::now()) {
        warn!(job_id = %job.id, error = %e, "Skipping pending job that cannot start");
        return Ok(None);
    }

    let claimed = queue.store_timed(|| queue.inner.store.compare_and_swap(&job)).await?;
    if claimed.is_none() {
        debug!(job_id = %job.id, "Lost claim race");
    }
    Ok(claimed)
}

/// Wakes the scheduler after `delay` unless `cancel` fires first.
pub(crate) fn wake_after(queue: &JobQueue, delay: Duration) {
    let wake = queue.inner.wake.clone();
    let cancel = queue.inner.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => wake.notify_one(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(global: usize, limits: &[(JobType, usize)]) -> Arc<SlotTracker> {
        Arc::new(SlotTracker::new(
            global,
            limits.iter().copied().collect(),
            Arc::new(Notify::new()),
        ))
    }

    #[test]
    fn test_type_ceiling() {
        let slots = tracker(10, &[(JobType::SeoAnalysis, 2)]);
        let a = slots.try_acquire(JobType::SeoAnalysis).unwrap();
        let _b = slots.try_acquire(JobType::SeoAnalysis).unwrap();
        assert!(slots.try_acquire(JobType::SeoAnalysis).is_none());
        assert!(slots.try_acquire(JobType::Demo).is_some());

        drop(a);
        assert!(slots.try_acquire(JobType::SeoAnalysis).is_some());
    }

    #[test]
    fn test_global_ceiling() {
        let slots = tracker(2, &[(JobType::Demo, 5), (JobType::DataSync, 5)]);
        let _a = slots.try_acquire(JobType::Demo).unwrap();
        let _b = slots.try_acquire(JobType::DataSync).unwrap();
        assert!(!slots.has_global_capacity());
        assert!(slots.try_acquire(JobType::Demo).is_none());
        assert_eq!(slots.in_flight(), 2);
        assert_eq!(slots.in_flight_for(JobType::Demo), 1);
    }

    #[test]
    fn test_open_slots_skips_saturated_types() {
        let slots = tracker(3, &[(JobType::SeoAnalysis, 1), (JobType::Demo, 5)]);
        let _seo = slots.try_acquire(JobType::SeoAnalysis).unwrap();

        let open: HashMap<JobType, usize> = slots.open_slots(100).into_iter().collect();
        assert!(!open.contains_key(&JobType::SeoAnalysis));
        assert_eq!(open[&JobType::Demo], 2);
        assert!(open.values().all(|free| *free <= 2));

        assert!(slots.open_slots(1).iter().all(|(_, free)| *free == 1));

        let _a = slots.try_acquire(JobType::Demo).unwrap();
        let _b = slots.try_acquire(JobType::Demo).unwrap();
        assert!(slots.open_slots(100).is_empty());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let slots = tracker(2, &[]);
        slots.wait_idle().await;

        let permit = slots.try_acquire(JobType::Demo).unwrap();
        let waiter = {
            let slots = slots.clone();
            tokio::spawn(async move { slots.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_wakes_scheduler() {
        let wake = Arc::new(Notify::new());
        let slots = Arc::new(SlotTracker::new(1, HashMap::new(), wake.clone()));
        drop(slots.try_acquire(JobType::Demo).unwrap());

        tokio::time::timeout(Duration::from_secs(1), wake.notified()).await.unwrap();
    }
}
