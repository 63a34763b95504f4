//! Error types produced by the resilience wrappers.

use beacon_core::{BeaconError, Retryable};
use std::time::Duration;

/// Error returned by circuit-breaker and retry wrappers.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call without invoking the operation.
    CircuitOpen {
        /// Breaker (resource) name.
        name: String,
        /// Time until the breaker will admit a probe call.
        retry_after: Duration,
    },
    /// The underlying operation failed.
    Operation(E),
}

impl<E> ResilienceError<E> {
    /// Returns the retry hint carried by a circuit-open rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Operation(_) => None,
        }
    }

    /// Returns true if the breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns the operation error, if the operation ran and failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen { name, retry_after } => write!(
                f,
                "Circuit breaker '{}' is open, retry after {}ms",
                name,
                retry_after.as_millis()
            ),
            Self::Operation(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

impl<E: Retryable> Retryable for ResilienceError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::Operation(e) => e.is_retryable(),
        }
    }
}

impl From<ResilienceError<BeaconError>> for BeaconError {
    fn from(err: ResilienceError<BeaconError>) -> Self {
        match err {
            ResilienceError::CircuitOpen { name, .. } => BeaconError::CircuitBreakerOpen(name),
            ResilienceError::Operation(e) => e,
        }
    }
}

/// An operation exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError {
    /// The deadline that elapsed.
    pub after: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation timed out after {}ms", self.after.as_millis())
    }
}

impl std::error::Error for TimeoutError {}

impl Retryable for TimeoutError {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl From<TimeoutError> for BeaconError {
    fn from(err: TimeoutError) -> Self {
        BeaconError::Timeout(err.to_string())
    }
}
