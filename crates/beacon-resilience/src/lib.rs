//! # Beacon Resilience
//!
//! Fault-isolation building blocks for calls to unreliable downstream
//! resources: exponential backoff, per-resource circuit breakers, a retry
//! executor that combines the two, and a timeout helper.

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod retry;
pub mod timeout;

pub use backoff::*;
pub use circuit_breaker::*;
pub use error::*;
pub use retry::*;
pub use timeout::*;
