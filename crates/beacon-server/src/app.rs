//! Application wiring and lifecycle.

use crate::processors::DemoProcessor;
use beacon_config::AppConfig;
use beacon_core::BeaconResult;
use beacon_jobs::{
    create_store, register_metrics, HealthReporter, JobQueue, JobQueueService, JobService, JobStore,
    ProcessorOptions, ProcessorRegistry,
};
use std::sync::Arc;
use tracing::info;

/// A running job queue with its health reporter.
///
/// Built by [`App::init`]; stopped by [`App::shutdown`].
pub struct App {
    config: AppConfig,
    queue: JobQueue,
    health: HealthReporter,
    service: Arc<dyn JobService>,
}

impl App {
    /// Connects the store, registers processors and starts the background
    /// tasks.
    pub async fn init(config: AppConfig) -> BeaconResult<Self> {
        let store = create_store(&config.jobs.store).await?;
        Self::with_store(config, store)
    }

    /// Like [`App::init`] with an already constructed store.
    pub fn with_store(config: AppConfig, store: Arc<dyn JobStore>) -> BeaconResult<Self> {
        register_metrics();

        let breakers = Arc::new(config.jobs.breaker.build_registry());
        let mut registry = ProcessorRegistry::new(breakers);
        registry.register(DemoProcessor, ProcessorOptions::new())?;

        let queue = JobQueue::new(config.jobs.clone(), store, registry)?;
        queue.start()?;

        let health = HealthReporter::new(queue.clone());
        health.start();

        let service: Arc<dyn JobService> = Arc::new(JobQueueService::new(queue.clone(), health.clone()));

        info!(
            job_types = ?queue.registry().job_types(),
            global_concurrency = config.jobs.queue.global_concurrency,
            "Job queue started"
        );

        Ok(Self {
            config,
            queue,
            health,
            service,
        })
    }

    /// The loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The queue engine.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The health reporter.
    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Caller-facing job service.
    pub fn service(&self) -> Arc<dyn JobService> {
        self.service.clone()
    }

    /// Stops health sampling, then drains the queue.
    pub async fn shutdown(self) {
        info!("Shutting down job queue");
        self.health.shutdown().await;
        self.queue.shutdown().await;
        info!("Job queue stopped");
    }
}
