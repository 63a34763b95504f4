//! End-to-end queue behavior against the in-memory store.

use beacon_jobs::prelude::*;
use beacon_jobs::{JobEvent, QueueConfig};
use beacon_resilience::BackoffPolicy;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn config(global_concurrency: usize) -> JobsConfig {
    let mut config = JobsConfig::default();
    config.queue = QueueConfig {
        global_concurrency,
        poll_interval_ms: 10,
        ..Default::default()
    };
    config.retry.backoff = BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_millis(40), 2.0);
    config
}

fn start(config: JobsConfig, registry: ProcessorRegistry) -> JobQueue {
    let queue = JobQueue::new(config, Arc::new(MemoryJobStore::new()), registry).unwrap();
    queue.start().unwrap();
    queue
}

async fn wait_finished(queue: &JobQueue, id: &JobId) -> beacon_jobs::Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = queue.get_status(id).await.unwrap().unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test]
async fn critical_job_overtakes_waiting_normal_jobs() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let mut registry = ProcessorRegistry::default();
    {
        let order = order.clone();
        let gate = gate.clone();
        registry
            .register_fn(JobType::Demo, ProcessorOptions::new(), move |payload: Value, _ctx| {
                let order = order.clone();
                let gate = gate.clone();
                async move {
                    let label = payload["label"].as_str().unwrap_or_default().to_string();
                    order.lock().push(label.clone());
                    if label == "normal-0" {
                        let _permit = gate.acquire().await;
                    }
                    Ok(())
                }
            })
            .unwrap();
    }

    let mut config = config(4);
    config.queue.type_concurrency.insert(JobType::Demo, 1);
    let queue = start(config, registry);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            queue
                .submit(JobType::Demo, json!({"label": format!("normal-{i}")}), Priority::Normal, None)
                .await
                .unwrap(),
        );
    }
    wait_until(|| !order.lock().is_empty()).await;

    // The single demo slot is held by normal-0 while the rest wait.
    ids.push(
        queue
            .submit(JobType::Demo, json!({"label": "critical"}), Priority::Critical, None)
            .await
            .unwrap(),
    );
    gate.add_permits(1);

    for id in &ids {
        assert_eq!(wait_finished(&queue, id).await.status, JobStatus::Completed);
    }
    queue.shutdown().await;

    let order = order.lock().clone();
    let expected: Vec<String> = ["normal-0", "critical", "normal-1", "normal-2", "normal-3", "normal-4"]
        .iter()
        .map(|label| label.to_string())
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn saturated_type_backlog_does_not_block_other_types() {
    let gate = Arc::new(Semaphore::new(0));
    let mut registry = ProcessorRegistry::default();
    {
        let gate = gate.clone();
        registry
            .register_fn(JobType::SeoAnalysis, ProcessorOptions::new(), move |_: Value, _ctx| {
                let gate = gate.clone();
                async move {
                    let _permit = gate.acquire().await;
                    Ok(())
                }
            })
            .unwrap();
    }
    registry
        .register_fn(JobType::Demo, ProcessorOptions::new(), |_: Value, _ctx| async move {
            Ok(json!({"ran": true}))
        })
        .unwrap();

    // A backlog larger than one scan window, all of a type with one slot.
    let mut config = config(4);
    config.queue.type_concurrency.insert(JobType::SeoAnalysis, 1);
    let scan_limit = config.queue.scan_limit;
    let queue = JobQueue::new(config, Arc::new(MemoryJobStore::new()), registry).unwrap();
    for _ in 0..=scan_limit {
        queue
            .submit(JobType::SeoAnalysis, json!({}), Priority::High, None)
            .await
            .unwrap();
    }
    let demo = queue.submit(JobType::Demo, json!({}), Priority::Low, None).await.unwrap();

    queue.start().unwrap();
    let job = wait_finished(&queue, &demo).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(queue.in_flight_for(JobType::SeoAnalysis), 1);

    gate.close();
    queue.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ProcessorRegistry::default();
    {
        let calls = calls.clone();
        registry
            .register_fn(JobType::DataSync, ProcessorOptions::new().max_attempts(3), move |_: Value, ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt < 3 {
                        return Err(JobError::transient("connection reset"));
                    }
                    Ok(json!({"synced": true}))
                }
            })
            .unwrap();
    }

    let queue = start(config(4), registry);
    let id = queue.submit(JobType::DataSync, json!({}), Priority::Normal, None).await.unwrap();
    let job = wait_finished(&queue, &id).await;
    queue.shutdown().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.result, Some(json!({"synced": true})));
    assert!(job.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_retryable_failure_fails_immediately() {
    let mut registry = ProcessorRegistry::default();
    registry
        .register_fn(JobType::ContentScoring, ProcessorOptions::new().max_attempts(5), |_: Value, _| async {
            Err::<(), _>(JobError::rejected("401 unauthorized"))
        })
        .unwrap();

    let queue = start(config(4), registry);
    let id = queue
        .submit(JobType::ContentScoring, json!({}), Priority::Normal, None)
        .await
        .unwrap();
    let job = wait_finished(&queue, &id).await;
    queue.shutdown().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.error.unwrap().contains("401"));
    assert!(job.failed_at.is_some());
}

#[tokio::test]
async fn open_breaker_rejects_without_invoking_processor() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ProcessorRegistry::default();
    {
        let calls = calls.clone();
        registry
            .register_fn(
                JobType::SeoAnalysis,
                ProcessorOptions::new().max_attempts(1).breaker("serp-api"),
                move |_: Value, _| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(JobError::transient("503 from serp"))
                    }
                },
            )
            .unwrap();
    }

    let queue = start(config(10), registry);
    for _ in 0..5 {
        let id = queue.submit(JobType::SeoAnalysis, json!({}), Priority::Normal, None).await.unwrap();
        assert_eq!(wait_finished(&queue, &id).await.status, JobStatus::Failed);
    }
    assert_eq!(queue.breakers().open_breakers(), vec!["serp-api".to_string()]);

    let id = queue.submit(JobType::SeoAnalysis, json!({}), Priority::Normal, None).await.unwrap();
    let job = wait_finished(&queue, &id).await;
    queue.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("serp-api"));
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn concurrency_ceilings_are_never_exceeded() {
    let global = Arc::new(Gauge::default());
    let mut registry = ProcessorRegistry::default();
    let mut per_type = Vec::new();

    for job_type in [JobType::Demo, JobType::DataSync] {
        let gauge = Arc::new(Gauge::default());
        per_type.push(gauge.clone());
        let global = global.clone();
        registry
            .register_fn(job_type, ProcessorOptions::new().concurrency(2), move |_: Value, _| {
                let gauge = gauge.clone();
                let global = global.clone();
                async move {
                    gauge.enter();
                    global.enter();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    global.exit();
                    gauge.exit();
                    Ok(())
                }
            })
            .unwrap();
    }

    let queue = start(config(3), registry);
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(queue.submit(JobType::Demo, json!({}), Priority::Normal, None).await.unwrap());
        ids.push(queue.submit(JobType::DataSync, json!({}), Priority::Normal, None).await.unwrap());
    }
    for id in &ids {
        assert_eq!(wait_finished(&queue, id).await.status, JobStatus::Completed);
    }
    queue.shutdown().await;

    assert!(global.max.load(Ordering::SeqCst) <= 3);
    assert!(global.max.load(Ordering::SeqCst) >= 2);
    for gauge in per_type {
        assert!(gauge.max.load(Ordering::SeqCst) <= 2);
    }
}

#[tokio::test]
async fn cancelling_a_running_job_keeps_it_cancelled() {
    let mut registry = ProcessorRegistry::default();
    registry
        .register_fn(JobType::KeywordResearch, ProcessorOptions::new(), |_: Value, ctx: JobContext| async move {
            ctx.cancellation_token.cancelled().await;
            Err::<(), _>(JobError::Cancelled)
        })
        .unwrap();

    let queue = start(config(2), registry);
    let id = queue
        .submit(JobType::KeywordResearch, json!({}), Priority::Normal, None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_status(&id).await.unwrap().unwrap().status != JobStatus::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(queue.cancel(&id).await.unwrap());
    let cancelled = queue.get_status(&id).await.unwrap().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!queue.cancel(&id).await.unwrap());
    let after = queue.get_status(&id).await.unwrap().unwrap();
    queue.shutdown().await;

    assert_eq!(after.status, JobStatus::Cancelled);
    assert_eq!(after, cancelled);
    assert!(after.cancelled_at.is_some());
}

#[tokio::test]
async fn progress_is_clamped_and_streamed() {
    let mut registry = ProcessorRegistry::default();
    registry
        .register_fn(JobType::CompetitiveAnalysis, ProcessorOptions::new(), |_: Value, ctx: JobContext| async move {
            ctx.update_progress(150, Some("done crawling".into())).await?;
            Ok(json!({"competitors": 4}))
        })
        .unwrap();

    let queue = JobQueue::new(config(2), Arc::new(MemoryJobStore::new()), registry).unwrap();
    let id = queue
        .submit(JobType::CompetitiveAnalysis, json!({}), Priority::High, None)
        .await
        .unwrap();
    let mut subscription = queue.subscribe(&id).await.unwrap();
    queue.start().unwrap();

    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = subscription.next().await {
            events.push(event);
        }
    })
    .await
    .unwrap();
    queue.shutdown().await;

    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::Progress { progress: 100, .. })));
    assert!(matches!(
        events.last(),
        Some(JobEvent::StatusChanged { status: JobStatus::Completed, .. })
    ));
}

#[tokio::test]
async fn slow_processor_times_out() {
    let mut registry = ProcessorRegistry::default();
    registry
        .register_fn(
            JobType::Demo,
            ProcessorOptions::new().max_attempts(1).timeout(Duration::from_millis(20)),
            |_: Value, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .unwrap();

    let queue = start(config(2), registry);
    let id = queue.submit(JobType::Demo, json!({}), Priority::Normal, None).await.unwrap();
    let job = wait_finished(&queue, &id).await;
    queue.shutdown().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn panicking_processor_fails_the_attempt_not_the_queue() {
    let mut registry = ProcessorRegistry::default();
    registry
        .register_fn(JobType::Demo, ProcessorOptions::new().max_attempts(1), |payload: Value, _| async move {
            if payload["explode"].as_bool().unwrap_or(false) {
                panic!("processor exploded");
            }
            Ok(())
        })
        .unwrap();

    let queue = start(config(2), registry);
    let bad = queue
        .submit(JobType::Demo, json!({"explode": true}), Priority::Normal, None)
        .await
        .unwrap();
    let good = queue
        .submit(JobType::Demo, json!({"explode": false}), Priority::Normal, None)
        .await
        .unwrap();

    let bad = wait_finished(&queue, &bad).await;
    let good = wait_finished(&queue, &good).await;
    queue.shutdown().await;

    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad.error.unwrap().contains("processor exploded"));
    assert_eq!(good.status, JobStatus::Completed);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let finished = Arc::new(AtomicU32::new(0));
    let mut registry = ProcessorRegistry::default();
    {
        let finished = finished.clone();
        registry
            .register_fn(JobType::EmailNotification, ProcessorOptions::new(), move |_: Value, _| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
    }

    let queue = start(config(4), registry);
    let id = queue
        .submit(JobType::EmailNotification, json!({}), Priority::Normal, None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    queue.shutdown().await;
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(
        queue.get_status(&id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}
