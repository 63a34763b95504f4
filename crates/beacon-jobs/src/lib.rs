//! Beacon Jobs - Resilient Job Queue
//!
//! A priority job queue with:
//! - A closed set of job types, each with its own concurrency ceiling
//! - Priority scheduling (critical, high, normal, low) with FIFO tie-breaks
//! - Retries with exponential backoff for retryable failures
//! - Per-resource circuit breakers around unreliable downstream calls
//! - Progress reporting and cooperative cancellation
//! - Memory or Redis persistence with optimistic concurrency
//! - A health reporter that turns queue and breaker state into a verdict
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Beacon Jobs Architecture                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Caller ── submit / cancel / get_status / subscribe             │
//! │     │                                                            │
//! │     ▼                                                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                     JobQueue                             │    │
//! │  │   validate (ProcessorRegistry) ──► JobStore.insert       │    │
//! │  └───────────────────────────┬─────────────────────────────┘    │
//! │                              │ wake                              │
//! │                              ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │   Scheduler: due retries ─► pending (priority, seq)      │    │
//! │  │   SlotTracker: global ceiling + per-type ceilings        │    │
//! │  │   claim = compare_and_swap(pending → processing)         │    │
//! │  └───────────────────────────┬─────────────────────────────┘    │
//! │                              ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │   Worker task: timeout ─► circuit breaker ─► processor   │    │
//! │  └──────┬───────────────────┬───────────────────┬──────────┘    │
//! │         ▼                   ▼                   ▼               │
//! │    ┌──────────┐      ┌────────────┐      ┌──────────┐           │
//! │    │Completed │      │  Retrying  │      │  Failed  │           │
//! │    └──────────┘      │ (backoff)  │      └──────────┘           │
//! │                      └────────────┘                              │
//! │                                                                  │
//! │  Maintenance: stale recovery + retention purge                   │
//! │  HealthReporter: depth, latency, error rate, breakers ─► verdict │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! let mut registry = ProcessorRegistry::default();
//! registry.register_fn(
//!     JobType::SeoAnalysis,
//!     ProcessorOptions::new().breaker("serp-api"),
//!     |payload: serde_json::Value, ctx: JobContext| async move {
//!         ctx.update_progress(50, Some("fetched".into())).await?;
//!         Ok(payload)
//!     },
//! )?;
//!
//! let queue = JobQueue::new(JobsConfig::default(), Arc::new(MemoryJobStore::new()), registry)?;
//! queue.start()?;
//!
//! let id = queue
//!     .submit(JobType::SeoAnalysis, json!({"url": "https://example.com"}), Priority::High, None)
//!     .await?;
//! ```

pub mod config;
pub mod di;
pub mod error;
pub mod health;
pub mod job;
pub mod maintenance;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod status;
pub mod store;

mod scheduler;
mod worker;

pub use config::{
    BreakerSettings, HealthConfig, JobsConfig, MaintenanceConfig, QueueConfig, RedisConfig, StoreBackend, StoreConfig,
};
pub use di::{JobQueueService, JobService};
pub use error::{JobError, JobResult};
pub use health::{evaluate, HealthMetrics, HealthReport, HealthReporter, HealthStatus};
pub use job::{Job, JobContext, JobId, JobStatusView, JobTimestamps, JobType};
pub use maintenance::MaintenanceReport;
pub use metrics::{register_metrics, BreakerMetrics, ExecutionSummary, JobMetrics, QueueMetrics};
pub use progress::{JobEvent, JobSubscription};
pub use queue::{JobQueue, Priority, QueueDepth, SubmitOptions};
pub use registry::{Processor, ProcessorOptions, ProcessorRegistry, Registration};
pub use status::JobStatus;
pub use store::{create_store, JobStore, MemoryJobStore, RedisJobStore};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::job::{JobType, JobStatusView};
    pub use crate::queue::{JobQueue, Priority, SubmitOptions};
    pub use crate::registry::{Processor, ProcessorOptions, ProcessorRegistry};
    pub use crate::store::{JobStore, MemoryJobStore};
    pub use crate::{JobContext, JobError, JobId, JobResult, JobStatus, JobsConfig};
    pub use async_trait::async_trait;
    pub use beacon_core::Retryable;
}
