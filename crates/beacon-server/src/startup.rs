//! Startup output and signal handling.

use beacon_config::AppConfig;
use tracing::{info, warn};

/// Logs the startup banner.
pub fn print_banner() {
    info!(r#"
    ____
   / __ )___  ____ __________  ____
  / __  / _ \/ __ `/ ___/ __ \/ __ \
 / /_/ /  __/ /_/ / /__/ /_/ / / / /
/_____/\___/\__,_/\___/\____/_/ /_/
    "#);
}

/// Logs the effective queue settings.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    let jobs = &config.jobs;
    info!("{}", separator);
    info!("Environment:        {}", config.app.environment);
    info!("Store:              {:?}", jobs.store.backend);
    info!("Global concurrency: {}", jobs.queue.global_concurrency);
    info!("Max attempts:       {}", jobs.retry.max_attempts);
    info!("Health interval:    {}ms", jobs.health.interval_ms);
    info!("{}", separator);
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
