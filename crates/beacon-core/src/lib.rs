//! # Beacon Core
//!
//! Shared error types, result aliases, classification traits, and logging
//! setup used by every Beacon crate.

pub mod error;
pub mod result;
pub mod telemetry;
pub mod traits;

pub use error::*;
pub use result::*;
pub use telemetry::{init_logging, LogFormat, LoggingConfig};
pub use traits::*;

// Re-export shaku for dependency injection
pub use shaku::Interface;
