//! Timeout wrapper for async operations.

use crate::TimeoutError;
use std::time::Duration;

/// Wraps an async operation with a timeout.
///
/// The operation future is dropped when the deadline elapses.
pub async fn with_timeout<F, Fut, T, E>(duration: Duration, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    tokio::time::timeout(duration, f())
        .await
        .map_err(|_| E::from(TimeoutError { after: duration }))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::BeaconError;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result: Result<i32, BeaconError> =
            with_timeout(Duration::from_secs(1), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_error() {
        let result: Result<i32, BeaconError> = with_timeout(Duration::from_secs(1), || async {
            Err(BeaconError::validation("bad"))
        })
        .await;
        assert!(matches!(result, Err(BeaconError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_exceeded() {
        let result: Result<i32, BeaconError> = with_timeout(Duration::from_millis(10), || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(42)
        })
        .await;
        assert!(matches!(result, Err(BeaconError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_plain_error_type() {
        let result: Result<(), TimeoutError> =
            with_timeout(Duration::from_millis(5), || std::future::pending()).await;
        assert_eq!(result.unwrap_err().after, Duration::from_millis(5));
    }
}
