//! Core traits shared across the resilience and job layers.

/// Classifies an error as transient or terminal.
///
/// The retry executor and the job queue both consult this to decide
/// whether another attempt is worthwhile. Transient failures (timeouts,
/// connection resets, rate limiting, 5xx-class responses) return `true`;
/// validation, authorization and quota failures return `false`.
pub trait Retryable {
    /// Returns true if retrying the failed operation may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionRefused
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
        )
    }
}
