//! # Beacon Config
//!
//! Configuration management for Beacon.
//! Supports layered configuration from files and environment variables,
//! validated as a whole before the process starts.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
