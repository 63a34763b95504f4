//! Unified error types for Beacon services.

use crate::Retryable;
use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for Beacon processes.
///
/// Processors and host wiring report failures through this enum; the job
/// layer maps it onto its own retry/fail decision via [`Retryable`].
#[derive(Error, Debug)]
pub enum BeaconError {
    // ============ Request Errors ============
    /// Resource not found
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict error (e.g., duplicate entry)
    #[error("Conflict: {0}")]
    Conflict(String),

    // ============ Authorization Errors ============
    /// Unauthorized access
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Forbidden access
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Quota for a downstream service is exhausted
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    // ============ Infrastructure Errors ============
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// External service error, with the downstream status code if known
    #[error("External service error: {service} - {message}")]
    ExternalService {
        service: String,
        message: String,
        status: Option<u16>,
    },

    /// Durable store error
    #[error("Store error: {0}")]
    Store(String),

    // ============ Resilience Errors ============
    /// Circuit breaker open
    #[error("Service unavailable: circuit breaker open for {0}")]
    CircuitBreakerOpen(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BeaconError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::CircuitBreakerOpen(_) => "CIRCUIT_BREAKER_OPEN",
            Self::Timeout(_) => "TIMEOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a not found error for a resource.
    #[must_use]
    pub fn not_found<T: ToString>(resource_type: &'static str, id: T) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an external service error from a downstream HTTP-style status.
    #[must_use]
    pub fn external<S: Into<String>, M: Into<String>>(service: S, status: u16, message: M) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }
}

impl Retryable for BeaconError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalService { status, .. } => match status {
                // 408 and 429 are transient, other 4xx mean the request itself is wrong
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
                None => true,
            },
            Self::Store(_)
            | Self::CircuitBreakerOpen(_)
            | Self::Timeout(_)
            | Self::RateLimitExceeded => true,
            Self::NotFound { .. }
            | Self::Validation(_)
            | Self::Conflict(_)
            | Self::Unauthorized(_)
            | Self::Forbidden(_)
            | Self::QuotaExceeded(_)
            | Self::Configuration(_)
            | Self::Internal(_)
            | Self::Other(_) => false,
        }
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON serialization error: {}", err))
    }
}
