//! Circuit breaker implementation.
//!
//! ```text
//! Closed ──(calls >= minimum && failure rate >= threshold)──▶ Open
//! Open ──(recovery timeout elapsed, next call)──▶ HalfOpen
//! HalfOpen ──(probe succeeds)──▶ Closed
//! HalfOpen ──(probe fails)──▶ Open
//! ```

mod registry;

pub use registry::CircuitBreakerRegistry;

use crate::ResilienceError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests are allowed.
    Closed,
    /// Circuit is open - requests are rejected.
    Open,
    /// Circuit is half-open - a single probe request is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0 to 1.0) at or above which the circuit opens.
    pub failure_threshold: f64,
    /// Calls that must be observed in the window before the rate is evaluated.
    pub minimum_calls: u64,
    /// Time an open circuit waits before admitting a probe, in milliseconds.
    pub recovery_timeout_ms: u64,
    /// Length of the closed-state monitoring window, in milliseconds.
    pub monitoring_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            minimum_calls: 5,
            recovery_timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Returns the recovery timeout as a Duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Returns the monitoring window as a Duration.
    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    /// Breaker (resource) name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Calls observed in the current window.
    pub total_calls: u64,
    /// Failed calls in the current window.
    pub failure_count: u64,
    /// Successful calls in the current window.
    pub success_count: u64,
    /// Observed failure rate in the current window.
    pub failure_rate: f64,
    /// Milliseconds until an open circuit admits a probe.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    total_calls: u64,
    failure_count: u64,
    success_count: u64,
    window_started: Instant,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            total_calls: 0,
            failure_count: 0,
            success_count: 0,
            window_started: now,
            next_attempt_at: None,
            probe_in_flight: false,
        }
    }

    fn reset_counters(&mut self, now: Instant) {
        self.total_calls = 0;
        self.failure_count = 0;
        self.success_count = 0;
        self.window_started = now;
    }

    fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_calls as f64
        }
    }
}

/// Circuit breaker for protecting against cascading failures.
///
/// One instance guards one named downstream resource. State is process-local
/// and starts closed.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission ticket for one call.
///
/// Dropping an unsettled probe ticket frees the half-open probe slot so a
/// cancelled probe cannot wedge the breaker.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record_outcome(success, self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new(Instant::now())),
        }
    }

    /// Creates a new circuit breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Returns the name of the circuit breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state without triggering any transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns a read-only snapshot of the breaker.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock();
        let retry_after_ms = match (inner.state, inner.next_attempt_at) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(now).as_millis() as u64),
            _ => None,
        };

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_rate: inner.failure_rate(),
            retry_after_ms,
        }
    }

    /// Executes a function with circuit breaker protection.
    ///
    /// Every error returned by the operation counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire() {
            Ok(permit) => permit,
            Err(retry_after) => {
                return Err(ResilienceError::CircuitOpen {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        match f().await {
            Ok(value) => {
                permit.settle(true);
                Ok(value)
            }
            Err(e) => {
                permit.settle(false);
                Err(ResilienceError::Operation(e))
            }
        }
    }

    /// Decides whether a call may proceed; `Err` carries the retry hint.
    fn acquire(&self) -> Result<CallPermit<'_>, Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let probe = match inner.state {
            CircuitState::Closed => {
                if now.saturating_duration_since(inner.window_started) >= self.config.monitoring_window() {
                    inner.reset_counters(now);
                }
                false
            }
            CircuitState::Open => {
                let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
                if now < next_attempt_at {
                    return Err(next_attempt_at - now);
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(breaker = %self.name, "Circuit breaker half-open, admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Duration::ZERO);
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record_outcome(&self, success: bool, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                if success {
                    inner.state = CircuitState::Closed;
                    inner.next_attempt_at = None;
                    inner.reset_counters(now);
                    info!(breaker = %self.name, "Circuit breaker closed after successful probe");
                } else {
                    self.trip(&mut inner, now);
                    warn!(breaker = %self.name, "Circuit breaker reopened after failed probe");
                }
            }
            CircuitState::Closed if !probe => {
                inner.total_calls += 1;
                if success {
                    inner.success_count += 1;
                } else {
                    inner.failure_count += 1;
                }

                if inner.total_calls >= self.config.minimum_calls
                    && inner.failure_rate() >= self.config.failure_threshold
                {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        calls = inner.total_calls,
                        "Circuit breaker opened"
                    );
                    self.trip(&mut inner, now);
                }
            }
            // Outcome of a call admitted under an earlier state.
            _ => {
                debug!(breaker = %self.name, state = %inner.state, "Ignoring stale call outcome");
            }
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.probe_in_flight = false;
        inner.next_attempt_at = Some(now + self.config.recovery_timeout());
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            debug!(breaker = %self.name, "Probe abandoned, slot released");
        }
    }

    /// Manually resets the circuit breaker to closed state.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        *inner = BreakerState::new(now);
        debug!(breaker = %self.name, "Circuit breaker manually reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: f64, minimum_calls: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            minimum_calls,
            recovery_timeout_ms: 1_000,
            monitoring_window_ms: 60_000,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<i32, ResilienceError<&'static str>> {
        cb.call(|| async { Err::<i32, &str>("error") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<i32, ResilienceError<&'static str>> {
        cb.call(|| async { Ok::<i32, &str>(42) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.name(), "test");
    }

    #[tokio::test]
    async fn test_successful_call_returns_value() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(succeed(&cb).await.unwrap(), 42);
        assert_eq!(cb.snapshot().success_count, 1);
    }

    #[tokio::test]
    async fn test_does_not_open_below_minimum_calls() {
        let cb = CircuitBreaker::new("test", config(0.5, 5));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_failure_rate_and_rejects_fast() {
        let cb = CircuitBreaker::new("serp-api", config(0.5, 5));
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<i32, &str>(1)
            })
            .await;

        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match result {
            Err(ResilienceError::CircuitOpen { name, retry_after }) => {
                assert_eq!(name, "serp-api");
                assert!(retry_after <= Duration::from_millis(1_000));
            }
            other => panic!("Expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mixed_outcomes_below_threshold_stay_closed() {
        let cb = CircuitBreaker::new("test", config(0.5, 4));
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = succeed(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_rate, 0.25);
    }

    #[tokio::test]
    async fn test_success_can_complete_minimum_calls_and_open() {
        let cb = CircuitBreaker::new("test", config(0.5, 5));
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new("test", config(0.5, 1));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(matches!(succeed(&cb).await, Err(ResilienceError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_millis(1)).await;
        // Still open until a call arrives.
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(succeed(&cb).await.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().total_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = CircuitBreaker::new("test", config(0.5, 1));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert!(matches!(fail(&cb).await, Err(ResilienceError::Operation(_))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().retry_after_ms, Some(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_flight() {
        let cb = CircuitBreaker::new("test", config(0.5, 1));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = cb.call(|| async move {
            let _ = release_rx.await;
            Ok::<i32, &str>(1)
        });
        tokio::pin!(probe);

        // Drive the probe until it parks on the channel.
        assert!(futures_poll_once(probe.as_mut()).await.is_none());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let second = succeed(&cb).await;
        assert!(matches!(second, Err(ResilienceError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cb = CircuitBreaker::new("test", config(0.5, 1));
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        {
            let probe = cb.call(|| std::future::pending::<Result<i32, &str>>());
            tokio::pin!(probe);
            assert!(futures_poll_once(probe.as_mut()).await.is_none());
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_window_resets_counters() {
        let cb = CircuitBreaker::new("test", config(0.5, 3));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().total_calls, 1);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let cb = CircuitBreaker::new("test", config(0.5, 1));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 42);
    }

    #[test]
    fn test_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 0.5);
        assert_eq!(config.minimum_calls, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(30));
    }

    /// Polls a future once, returning its output if it completed.
    async fn futures_poll_once<F: Future + Unpin>(fut: F) -> Option<F::Output> {
        let mut fut = fut;
        std::future::poll_fn(|cx| match std::pin::Pin::new(&mut fut).poll(cx) {
            std::task::Poll::Ready(out) => std::task::Poll::Ready(Some(out)),
            std::task::Poll::Pending => std::task::Poll::Ready(None),
        })
        .await
    }
}
