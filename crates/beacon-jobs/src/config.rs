//! Job queue configuration.

use crate::job::JobType;
use beacon_resilience::{BackoffPolicy, CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the job queue system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Scheduler and worker configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry policy for failed job attempts.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker defaults and per-resource overrides.
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Health reporter configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Maintenance task configuration.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Durable store configuration.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Scheduler and worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum jobs processing at once across all types.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,

    /// Per-type ceilings, overriding registration and built-in defaults.
    #[serde(default)]
    pub type_concurrency: HashMap<JobType, usize>,

    /// Scheduler poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Default invocation timeout in milliseconds.
    #[serde(default = "default_job_timeout")]
    pub default_timeout_ms: u64,

    /// Time shutdown waits for in-flight jobs, in milliseconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Most pending jobs read per job type in one scheduling round.
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,

    /// Capacity of the progress event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Longest pause of dispatch while the store is unavailable, in milliseconds.
    #[serde(default = "default_max_store_pause")]
    pub max_store_pause_ms: u64,

    /// Deadline for a single durable store operation, in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Retry policy for durable store writes.
    #[serde(default = "default_store_retry")]
    pub store_retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            type_concurrency: HashMap::new(),
            poll_interval_ms: default_poll_interval(),
            default_timeout_ms: default_job_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            scan_limit: default_scan_limit(),
            event_capacity: default_event_capacity(),
            max_store_pause_ms: default_max_store_pause(),
            store_timeout_ms: default_store_timeout(),
            store_retry: default_store_retry(),
        }
    }
}

fn default_global_concurrency() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    500
}

fn default_job_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_shutdown_timeout() -> u64 {
    30_000
}

fn default_scan_limit() -> usize {
    100
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_store_pause() -> u64 {
    30_000
}

fn default_store_timeout() -> u64 {
    5_000
}

fn default_store_retry() -> RetryConfig {
    RetryConfig::with_max_attempts(3).with_backoff(BackoffPolicy {
        initial_delay_ms: 100,
        max_delay_ms: 2_000,
        multiplier: 2.0,
        jitter: true,
    })
}

impl QueueConfig {
    /// Get poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get default job timeout as Duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Get shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Get the longest store pause as Duration.
    pub fn max_store_pause(&self) -> Duration {
        Duration::from_millis(self.max_store_pause_ms)
    }

    /// Get the store operation deadline as Duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Circuit breaker defaults plus per-resource overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Configuration for breakers without an override.
    #[serde(flatten)]
    pub defaults: CircuitBreakerConfig,

    /// Per-resource configuration keyed by breaker name.
    #[serde(default)]
    pub resources: HashMap<String, CircuitBreakerConfig>,
}

impl BreakerSettings {
    /// Builds a breaker registry carrying these defaults and overrides.
    pub fn build_registry(&self) -> CircuitBreakerRegistry {
        self.resources
            .iter()
            .fold(CircuitBreakerRegistry::new(self.defaults.clone()), |registry, (name, config)| {
                registry.with_config(name.clone(), config.clone())
            })
    }
}

/// Health reporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Sampling interval in milliseconds.
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Error rate above which the queue is degraded.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    /// Average latency above which the queue is degraded, in milliseconds.
    #[serde(default = "default_max_average_latency")]
    pub max_average_latency_ms: u64,

    /// Pending backlog above which the queue is degraded.
    #[serde(default = "default_max_pending")]
    pub max_pending: u64,

    /// Sliding window for latency and error rate, in seconds.
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            max_error_rate: default_max_error_rate(),
            max_average_latency_ms: default_max_average_latency(),
            max_pending: default_max_pending(),
            window_secs: default_window(),
        }
    }
}

fn default_health_interval() -> u64 {
    30_000
}

fn default_max_error_rate() -> f64 {
    0.05
}

fn default_max_average_latency() -> u64 {
    30_000
}

fn default_max_pending() -> u64 {
    1_000
}

fn default_window() -> u64 {
    300
}

impl HealthConfig {
    /// Get sampling interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get the statistics window as Duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Maintenance task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Run interval in milliseconds.
    #[serde(default = "default_maintenance_interval")]
    pub interval_ms: u64,

    /// Grace period past a job's timeout before it counts as stale, in milliseconds.
    #[serde(default = "default_stale_grace")]
    pub stale_grace_ms: u64,

    /// Age after which finished jobs are purged, in seconds.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_maintenance_interval(),
            stale_grace_ms: default_stale_grace(),
            retention_secs: default_retention(),
        }
    }
}

fn default_maintenance_interval() -> u64 {
    60_000
}

fn default_stale_grace() -> u64 {
    60_000
}

fn default_retention() -> u64 {
    7 * 24 * 3600 // 7 days
}

impl MaintenanceConfig {
    /// Get run interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get stale grace period as Duration.
    pub fn stale_grace(&self) -> Duration {
        Duration::from_millis(self.stale_grace_ms)
    }

    /// Get retention as Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; jobs do not survive a restart.
    #[default]
    Memory,
    /// Redis-backed durable store.
    Redis,
}

/// Durable store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "beacon:jobs".to_string()
}
