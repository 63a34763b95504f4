//! Health verdicts for the queue.
//!
//! The reporter only reads: queue depth from the store, breaker snapshots,
//! and the execution window. It never changes queue or breaker state.

use crate::config::HealthConfig;
use crate::metrics::{BreakerMetrics, QueueMetrics};
use crate::queue::{JobQueue, QueueDepth};
use beacon_resilience::{CircuitBreakerSnapshot, CircuitState};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Overall verdict, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Numeric level exported as a gauge.
    pub const fn level(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampled measurements behind a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub queue_depth: QueueDepth,
    pub breakers: Vec<CircuitBreakerSnapshot>,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub samples: usize,
    pub throughput_per_minute: f64,
    pub in_flight: usize,
    pub store_reachable: bool,
}

/// Health verdict with the measurements and suggested actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub metrics: HealthMetrics,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Derives a verdict from sampled metrics.
///
/// An open breaker or an unreachable store is unhealthy. Error rate or
/// latency above their ceilings, a half-open breaker, or a backlog above
/// `max_pending` is degraded.
pub fn evaluate(metrics: &HealthMetrics, config: &HealthConfig) -> (HealthStatus, Vec<String>) {
    let mut status = HealthStatus::Healthy;
    let mut recommendations = Vec::new();

    if !metrics.store_reachable {
        status = status.max(HealthStatus::Unhealthy);
        recommendations.push("Job store is unreachable; dispatch is paused until it recovers".to_string());
    }

    for breaker in &metrics.breakers {
        match breaker.state {
            CircuitState::Open => {
                status = status.max(HealthStatus::Unhealthy);
                recommendations.push(format!(
                    "Circuit breaker '{}' is open after a {:.0}% failure rate; check the downstream service",
                    breaker.name,
                    breaker.failure_rate * 100.0
                ));
            }
            CircuitState::HalfOpen => {
                status = status.max(HealthStatus::Degraded);
                recommendations.push(format!(
                    "Circuit breaker '{}' is probing recovery",
                    breaker.name
                ));
            }
            CircuitState::Closed => {}
        }
    }

    if metrics.error_rate > config.max_error_rate {
        status = status.max(HealthStatus::Degraded);
        recommendations.push(format!(
            "Error rate {:.1}% exceeds {:.1}%; inspect recent job failures",
            metrics.error_rate * 100.0,
            config.max_error_rate * 100.0
        ));
    }

    if metrics.average_latency_ms > config.max_average_latency_ms as f64 {
        status = status.max(HealthStatus::Degraded);
        recommendations.push(format!(
            "Average processing latency {:.0}ms exceeds {}ms; consider raising timeouts or concurrency",
            metrics.average_latency_ms, config.max_average_latency_ms
        ));
    }

    if metrics.queue_depth.pending > config.max_pending {
        status = status.max(HealthStatus::Degraded);
        recommendations.push(format!(
            "{} jobs pending (limit {}); consider adding workers",
            metrics.queue_depth.pending, config.max_pending
        ));
    }

    (status, recommendations)
}

struct ReporterInner {
    queue: JobQueue,
    config: HealthConfig,
    latest: RwLock<Option<HealthReport>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Samples the queue on an interval and keeps the latest report.
#[derive(Clone)]
pub struct HealthReporter {
    inner: Arc<ReporterInner>,
}

impl fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReporter")
            .field("interval_ms", &self.inner.config.interval_ms)
            .field("running", &self.inner.task.lock().is_some())
            .finish()
    }
}

impl HealthReporter {
    /// Creates a reporter using the queue's health configuration.
    pub fn new(queue: JobQueue) -> Self {
        let config = queue.config().health.clone();
        Self {
            inner: Arc::new(ReporterInner {
                queue,
                config,
                latest: RwLock::new(None),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Samples now and returns the report. Also updates the latest report
    /// and the exported gauges.
    pub async fn check(&self) -> HealthReport {
        let queue = &self.inner.queue;

        let store_reachable = queue.ping_store().await;
        let queue_depth = match queue.queue_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %e, "Could not read queue depth");
                QueueDepth::default()
            }
        };
        let summary = queue.execution_summary();

        let metrics = HealthMetrics {
            queue_depth,
            breakers: queue.breakers().snapshots(),
            average_latency_ms: summary.average_latency_ms,
            error_rate: summary.error_rate,
            samples: summary.samples,
            throughput_per_minute: summary.throughput_per_minute,
            in_flight: queue.in_flight(),
            store_reachable,
        };
        let (status, recommendations) = evaluate(&metrics, &self.inner.config);

        QueueMetrics::record_depth(&metrics.queue_depth);
        QueueMetrics::record_health(status.level(), metrics.error_rate);
        for breaker in &metrics.breakers {
            BreakerMetrics::record(breaker);
        }

        let report = HealthReport {
            status,
            metrics,
            recommendations,
            checked_at: Utc::now(),
        };
        *self.inner.latest.write() = Some(report.clone());
        report
    }

    /// Most recent report, if a check has run.
    pub fn latest(&self) -> Option<HealthReport> {
        self.inner.latest.read().clone()
    }

    /// Starts periodic sampling. Calling it again has no effect.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }

        let reporter = self.clone();
        *task = Some(tokio::spawn(async move { reporter.run().await }));
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<HealthStatus> = None;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.check().await;
            if previous != Some(report.status) {
                match report.status {
                    HealthStatus::Healthy => info!(status = %report.status, "Job queue health changed"),
                    HealthStatus::Degraded => warn!(
                        status = %report.status,
                        recommendations = ?report.recommendations,
                        "Job queue health changed"
                    ),
                    HealthStatus::Unhealthy => error!(
                        status = %report.status,
                        recommendations = ?report.recommendations,
                        "Job queue health changed"
                    ),
                }
                previous = Some(report.status);
            }
        }
    }

    /// Stops periodic sampling.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health reporter ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::registry::ProcessorRegistry;
    use crate::store::{MemoryJobStore, MockJobStore};
    use crate::JobError;
    use beacon_resilience::{CircuitBreakerConfig, ResilienceError};

    fn metrics() -> HealthMetrics {
        HealthMetrics {
            queue_depth: QueueDepth::default(),
            breakers: Vec::new(),
            average_latency_ms: 120.0,
            error_rate: 0.0,
            samples: 10,
            throughput_per_minute: 5.0,
            in_flight: 1,
            store_reachable: true,
        }
    }

    fn breaker(state: CircuitState) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: "serp-api".into(),
            state,
            total_calls: 10,
            failure_count: 8,
            success_count: 2,
            failure_rate: 0.8,
            retry_after_ms: None,
        }
    }

    #[test]
    fn test_quiet_queue_is_healthy() {
        let (status, recommendations) = evaluate(&metrics(), &HealthConfig::default());
        assert_eq!(status, HealthStatus::Healthy);
        assert!(recommendations.is_empty());
    }

    #[test]
    fn test_open_breaker_is_unhealthy() {
        let mut m = metrics();
        m.breakers.push(breaker(CircuitState::Open));
        let (status, recommendations) = evaluate(&m, &HealthConfig::default());
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(recommendations[0].contains("serp-api"));
    }

    #[test]
    fn test_degraded_conditions() {
        let config = HealthConfig::default();

        let mut high_errors = metrics();
        high_errors.error_rate = 0.06;
        assert_eq!(evaluate(&high_errors, &config).0, HealthStatus::Degraded);

        let mut slow = metrics();
        slow.average_latency_ms = 31_000.0;
        assert_eq!(evaluate(&slow, &config).0, HealthStatus::Degraded);

        let mut probing = metrics();
        probing.breakers.push(breaker(CircuitState::HalfOpen));
        assert_eq!(evaluate(&probing, &config).0, HealthStatus::Degraded);

        let mut backlog = metrics();
        backlog.queue_depth.pending = config.max_pending + 1;
        assert_eq!(evaluate(&backlog, &config).0, HealthStatus::Degraded);
    }

    #[test]
    fn test_worst_condition_wins() {
        let mut m = metrics();
        m.error_rate = 0.5;
        m.store_reachable = false;
        let (status, recommendations) = evaluate(&m, &HealthConfig::default());
        assert_eq!(status, HealthStatus::Unhealthy);
        assert_eq!(recommendations.len(), 2);
    }

    #[test]
    fn test_report_wire_shape() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            metrics: metrics(),
            recommendations: vec!["look".into()],
            checked_at: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["metrics"]["queue_depth"]["pending"], 0);
        assert_eq!(json["recommendations"][0], "look");
    }

    #[tokio::test]
    async fn test_check_reports_open_breaker_without_changing_it() {
        let queue = JobQueue::new(
            JobsConfig::default(),
            Arc::new(MemoryJobStore::new()),
            ProcessorRegistry::default(),
        )
        .unwrap();
        let breaker = queue.breakers().get_or_create_with(
            "openai",
            CircuitBreakerConfig {
                minimum_calls: 1,
                ..Default::default()
            },
        );
        let _: Result<(), ResilienceError<&str>> = breaker.call(|| async { Err("503") }).await;

        let reporter = HealthReporter::new(queue);
        assert!(reporter.latest().is_none());

        let report = reporter.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.metrics.breakers[0].state, CircuitState::Open);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(reporter.latest().unwrap().status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unhealthy() {
        let mut store = MockJobStore::new();
        store
            .expect_ping()
            .returning(|| Err(JobError::Store("connection refused".into())));
        store
            .expect_count_by_status()
            .returning(|| Err(JobError::Store("connection refused".into())));

        let mut config = JobsConfig::default();
        config.queue.store_retry.max_attempts = 1;
        let queue = JobQueue::new(config, Arc::new(store), ProcessorRegistry::default()).unwrap();

        let report = HealthReporter::new(queue).check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.metrics.store_reachable);
    }
}
