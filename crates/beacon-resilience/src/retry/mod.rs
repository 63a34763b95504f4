//! Retry executor combining backoff with circuit breakers.

use crate::{BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, ResilienceError};
use beacon_core::Retryable;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration with the specified max attempts.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Replaces the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Executes operations with retry, backoff and optional breaker protection.
///
/// Cloning is cheap; clones share the breaker registry.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RetryExecutor {
    /// Creates an executor backed by the given breaker registry.
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    /// Returns the breaker registry.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Runs `op`, retrying errors that classify themselves as retryable.
    ///
    /// When `breaker` names a resource, every attempt goes through that
    /// resource's breaker from the registry.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        config: &RetryConfig,
        breaker: Option<&str>,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let breaker = breaker.map(|name| self.breakers.get_or_create(name));
        self.execute_when(config, breaker, |e: &ResilienceError<E>| e.is_retryable(), op)
            .await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), creating the
    /// named breaker with an explicit configuration on first use.
    pub async fn execute_guarded<F, Fut, T, E>(
        &self,
        config: &RetryConfig,
        breaker: &str,
        breaker_config: &CircuitBreakerConfig,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let breaker = self.breakers.get_or_create_with(breaker, breaker_config.clone());
        self.execute_when(config, Some(breaker), |e: &ResilienceError<E>| e.is_retryable(), op)
            .await
    }

    /// Runs `op` with a caller-supplied retry condition.
    ///
    /// Errors for which `condition` returns false propagate immediately. After
    /// the last attempt the last error propagates. A circuit-open rejection
    /// waits at least its retry hint before the next attempt.
    pub async fn execute_when<F, Fut, T, E, C>(
        &self,
        config: &RetryConfig,
        breaker: Option<Arc<CircuitBreaker>>,
        condition: C,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&ResilienceError<E>) -> bool,
        E: Display,
    {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match &breaker {
                Some(breaker) => breaker.call(|| op()).await,
                None => op().await.map_err(ResilienceError::Operation),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !condition(&err) {
                debug!(attempt, error = %err, "Error is not retryable, giving up");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            let delay = config
                .backoff
                .delay_for_attempt(attempt)
                .max(err.retry_after().unwrap_or_default());
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
