//! Prometheus metrics for job queue monitoring.
//!
//! Counters and histograms are emitted through the `metrics` facade; install
//! an exporter in the binary to scrape them. [`ExecutionStats`] keeps the
//! in-process sliding window the health reporter reads.

use crate::queue::QueueDepth;
use beacon_resilience::{CircuitBreakerSnapshot, CircuitState};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs submitted.
    pub const JOBS_SUBMITTED_TOTAL: &str = "beacon_jobs_submitted_total";
    /// Total attempts started.
    pub const JOBS_STARTED_TOTAL: &str = "beacon_jobs_started_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "beacon_jobs_completed_total";
    /// Total jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "beacon_jobs_failed_total";
    /// Total attempts scheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "beacon_jobs_retried_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "beacon_jobs_cancelled_total";
    /// Total attempts timed out.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "beacon_jobs_timed_out_total";
    /// Total stale jobs recovered by maintenance.
    pub const JOBS_RECOVERED_TOTAL: &str = "beacon_jobs_recovered_total";
    /// Total finished jobs purged.
    pub const JOBS_PURGED_TOTAL: &str = "beacon_jobs_purged_total";

    /// Jobs by status.
    pub const JOBS_BY_STATUS: &str = "beacon_jobs";
    /// Jobs executing in this process.
    pub const JOBS_IN_FLIGHT: &str = "beacon_jobs_in_flight";

    /// Attempt duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "beacon_job_duration_seconds";
    /// Time from submission to first attempt, in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "beacon_job_wait_time_seconds";

    /// Circuit breaker state (0 closed, 1 half-open, 2 open).
    pub const BREAKER_STATE: &str = "beacon_circuit_breaker_state";
    /// Circuit breaker failure rate in the current window.
    pub const BREAKER_FAILURE_RATE: &str = "beacon_circuit_breaker_failure_rate";

    /// Overall health (0 healthy, 1 degraded, 2 unhealthy).
    pub const HEALTH_STATUS: &str = "beacon_jobs_health_status";
    /// Error rate over the health window.
    pub const ERROR_RATE: &str = "beacon_jobs_error_rate";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_SUBMITTED_TOTAL, "Total number of jobs submitted");
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of job attempts started");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed permanently");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of attempts scheduled for retry");
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total number of jobs cancelled");
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of attempts that timed out");
    describe_counter!(names::JOBS_RECOVERED_TOTAL, "Total number of stale jobs recovered");
    describe_counter!(names::JOBS_PURGED_TOTAL, "Total number of finished jobs purged");

    describe_gauge!(names::JOBS_BY_STATUS, "Current number of jobs by status");
    describe_gauge!(names::JOBS_IN_FLIGHT, "Jobs executing in this process");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job attempt duration in seconds");
    describe_histogram!(names::JOB_WAIT_TIME_SECONDS, "Time from submission to first attempt in seconds");

    describe_gauge!(names::BREAKER_STATE, "Circuit breaker state (0 closed, 1 half-open, 2 open)");
    describe_gauge!(names::BREAKER_FAILURE_RATE, "Circuit breaker failure rate in the current window");

    describe_gauge!(names::HEALTH_STATUS, "Queue health (0 healthy, 1 degraded, 2 unhealthy)");
    describe_gauge!(names::ERROR_RATE, "Attempt error rate over the health window");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job submitted.
    pub fn job_submitted(job_type: &str, priority: &str) {
        counter!(
            names::JOBS_SUBMITTED_TOTAL,
            "job_type" => job_type.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record an attempt started, with the time the job waited since submission.
    pub fn job_started(job_type: &str, attempt: u32, wait: Duration) {
        counter!(names::JOBS_STARTED_TOTAL, "job_type" => job_type.to_string()).increment(1);
        if attempt == 1 {
            histogram!(names::JOB_WAIT_TIME_SECONDS, "job_type" => job_type.to_string()).record(wait.as_secs_f64());
        }
    }

    /// Record a job completed.
    pub fn job_completed(job_type: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "job_type" => job_type.to_string()).increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed permanently.
    pub fn job_failed(job_type: &str, error_kind: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_type" => job_type.to_string(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record an attempt scheduled for retry.
    pub fn job_retried(job_type: &str, error_kind: &str, duration: Duration) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_type" => job_type.to_string(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "retrying"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job cancelled.
    pub fn job_cancelled(job_type: &str) {
        counter!(names::JOBS_CANCELLED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    /// Record an attempt timed out.
    pub fn job_timed_out(job_type: &str) {
        counter!(names::JOBS_TIMED_OUT_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    /// Record a stale job recovered by maintenance.
    pub fn job_recovered(job_type: &str) {
        counter!(names::JOBS_RECOVERED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    /// Record finished jobs purged.
    pub fn jobs_purged(count: u64) {
        counter!(names::JOBS_PURGED_TOTAL).increment(count);
    }
}

/// Queue gauges.
#[derive(Clone)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Update per-status gauges.
    pub fn record_depth(depth: &QueueDepth) {
        for status in crate::status::JobStatus::ALL {
            gauge!(names::JOBS_BY_STATUS, "status" => status.as_str()).set(depth.get(status) as f64);
        }
    }

    /// Update in-flight gauge.
    pub fn set_in_flight(count: usize) {
        gauge!(names::JOBS_IN_FLIGHT).set(count as f64);
    }

    /// Update health gauges.
    pub fn record_health(status_level: u8, error_rate: f64) {
        gauge!(names::HEALTH_STATUS).set(f64::from(status_level));
        gauge!(names::ERROR_RATE).set(error_rate);
    }
}

/// Circuit breaker gauges.
#[derive(Clone)]
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record a breaker snapshot.
    pub fn record(snapshot: &CircuitBreakerSnapshot) {
        let level = match snapshot.state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        gauge!(names::BREAKER_STATE, "breaker" => snapshot.name.clone()).set(level);
        gauge!(names::BREAKER_FAILURE_RATE, "breaker" => snapshot.name.clone()).set(snapshot.failure_rate);
    }
}

const MAX_SAMPLES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
    success: bool,
}

/// Attempt outcomes over a sliding time window.
#[derive(Debug)]
pub(crate) struct ExecutionStats {
    window: Duration,
    created: Instant,
    samples: Mutex<VecDeque<Sample>>,
}

/// Aggregates over the recent window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Attempts finished in the window.
    pub samples: usize,
    /// Attempts that ended in an error.
    pub errors: usize,
    /// `errors / samples`, 0 with no samples.
    pub error_rate: f64,
    /// Mean attempt latency in milliseconds.
    pub average_latency_ms: f64,
    /// Attempts finished per minute.
    pub throughput_per_minute: f64,
}

impl ExecutionStats {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            created: Instant::now(),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record(&self, latency: Duration, success: bool) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::evict(&mut samples, now, self.window);
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(Sample {
            at: now,
            latency,
            success,
        });
    }

    pub(crate) fn summary(&self) -> ExecutionSummary {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::evict(&mut samples, now, self.window);

        let count = samples.len();
        if count == 0 {
            return ExecutionSummary::default();
        }

        let errors = samples.iter().filter(|s| !s.success).count();
        let total_latency: Duration = samples.iter().map(|s| s.latency).sum();
        let observed = now.duration_since(self.created).min(self.window);
        let minutes = (observed.as_secs_f64() / 60.0).max(1.0 / 60.0);

        ExecutionSummary {
            samples: count,
            errors,
            error_rate: errors as f64 / count as f64,
            average_latency_ms: total_latency.as_secs_f64() * 1000.0 / count as f64,
            throughput_per_minute: count as f64 / minutes,
        }
    }

    fn evict(samples: &mut VecDeque<Sample>, now: Instant, window: Duration) {
        while let Some(oldest) = samples.front() {
            if now.duration_since(oldest.at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
