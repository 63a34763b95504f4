//! # Beacon Server Library
//!
//! Wiring and lifecycle for the Beacon job queue host process.

pub mod app;
pub mod processors;
pub mod startup;

pub use app::App;
