//! Job error types.

use crate::status::JobStatus;
use beacon_core::{BeaconError, Retryable};
use beacon_resilience::{ResilienceError, TimeoutError};
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
///
/// Processors return these; [`Retryable::is_retryable`] decides whether a
/// failed attempt is retried or fails the job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Payload or submission is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No processor is registered for the job type.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Transient downstream failure (connection reset, 5xx, rate limited).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Terminal downstream failure (authorization, 4xx, quota exhausted).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Invocation exceeded its timeout.
    #[error("Job timed out after {0}ms")]
    Timeout(u64),

    /// A circuit breaker rejected the call without running it.
    #[error("Circuit breaker '{resource}' is open, retry after {retry_after_ms}ms")]
    CircuitOpen { resource: String, retry_after_ms: u64 },

    /// Durable store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Status change not allowed by the job state machine.
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Job was cancelled.
    #[error("Job was cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Processor panicked.
    #[error("Processor panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Creates a retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a terminal failure.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Returns the minimum wait requested by the error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after_ms, .. } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }

    /// Short label used in metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownJobType(_) => "unknown_job_type",
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient",
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Store(_) | Self::Redis(_) | Self::Pool(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Cancelled => "cancelled",
            Self::Configuration(_) => "configuration",
            Self::Panicked(_) => "panicked",
        }
    }
}

impl Retryable for JobError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transient(_)
                | JobError::Timeout(_)
                | JobError::CircuitOpen { .. }
                | JobError::Store(_)
                | JobError::Redis(_)
                | JobError::Pool(_)
                | JobError::Panicked(_)
        )
    }
}

impl From<BeaconError> for JobError {
    fn from(err: BeaconError) -> Self {
        match err {
            BeaconError::Validation(msg) => JobError::Validation(msg),
            BeaconError::Configuration(msg) => JobError::Configuration(msg),
            BeaconError::NotFound { resource_type, id } => {
                JobError::Rejected(format!("{} {} not found", resource_type, id))
            }
            BeaconError::CircuitBreakerOpen(resource) => JobError::CircuitOpen {
                resource,
                retry_after_ms: 0,
            },
            BeaconError::Store(msg) => JobError::Store(msg),
            other if other.is_retryable() => JobError::Transient(other.to_string()),
            other => JobError::Rejected(other.to_string()),
        }
    }
}

impl From<JobError> for BeaconError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(msg) => BeaconError::Validation(msg),
            JobError::Configuration(msg) => BeaconError::Configuration(msg),
            JobError::Store(msg) => BeaconError::Store(msg),
            err @ (JobError::Redis(_) | JobError::Pool(_)) => BeaconError::Store(err.to_string()),
            other => BeaconError::Other(other.into()),
        }
    }
}

impl From<TimeoutError> for JobError {
    fn from(err: TimeoutError) -> Self {
        JobError::Timeout(err.after.as_millis() as u64)
    }
}

impl<E: Into<JobError>> From<ResilienceError<E>> for JobError {
    fn from(err: ResilienceError<E>) -> Self {
        match err {
            ResilienceError::CircuitOpen { name, retry_after } => JobError::CircuitOpen {
                resource: name,
                retry_after_ms: retry_after.as_millis() as u64,
            },
            ResilienceError::Operation(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(JobError::transient("connection reset").is_retryable());
        assert!(JobError::Timeout(30_000).is_retryable());
        assert!(JobError::Store("down".into()).is_retryable());
        assert!(JobError::Panicked("index out of bounds".into()).is_retryable());
        assert!(JobError::CircuitOpen {
            resource: "serp".into(),
            retry_after_ms: 10
        }
        .is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!JobError::Validation("missing url".into()).is_retryable());
        assert!(!JobError::rejected("401").is_retryable());
        assert!(!JobError::UnknownJobType("mystery".into()).is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::Configuration("no processor".into()).is_retryable());
    }

    #[test]
    fn test_into_beacon_error() {
        assert!(matches!(
            BeaconError::from(JobError::Configuration("zero".into())),
            BeaconError::Configuration(_)
        ));
        assert!(matches!(BeaconError::from(JobError::Store("down".into())), BeaconError::Store(_)));
        assert!(matches!(BeaconError::from(JobError::Cancelled), BeaconError::Other(_)));
    }

    #[test]
    fn test_from_beacon_error_keeps_classification() {
        let job_err = JobError::from(BeaconError::external("serp", 503, "unavailable"));
        assert!(matches!(job_err, JobError::Transient(_)));

        let job_err = JobError::from(BeaconError::external("serp", 401, "bad key"));
        assert!(matches!(job_err, JobError::Rejected(_)));

        let job_err = JobError::from(BeaconError::QuotaExceeded("credits".into()));
        assert!(!job_err.is_retryable());

        let job_err = JobError::from(BeaconError::validation("bad"));
        assert!(matches!(job_err, JobError::Validation(_)));
    }

    #[test]
    fn test_from_resilience_error() {
        let err: ResilienceError<BeaconError> = ResilienceError::CircuitOpen {
            name: "openai".into(),
            retry_after: Duration::from_millis(1500),
        };
        let job_err = JobError::from(err);
        assert_eq!(job_err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(job_err.kind(), "circuit_open");

        let err: ResilienceError<JobError> = ResilienceError::Operation(JobError::rejected("nope"));
        assert!(matches!(JobError::from(err), JobError::Rejected(_)));
    }

    #[test]
    fn test_from_timeout_error() {
        let job_err = JobError::from(TimeoutError {
            after: Duration::from_secs(2),
        });
        assert!(matches!(job_err, JobError::Timeout(2000)));
        assert!(job_err.to_string().contains("2000"));
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = JobError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Processing,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed") && msg.contains("processing"));
    }
}
