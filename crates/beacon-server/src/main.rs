//! # Beacon Server
//!
//! Runs the job queue until Ctrl+C or SIGTERM, then drains in-flight jobs.

use anyhow::Context;
use beacon_config::ConfigLoader;
use beacon_core::init_logging;
use beacon_server::startup::{print_banner, print_startup_info, shutdown_signal};
use beacon_server::App;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // The subscriber may not be installed if configuration failed.
        eprintln!("Application error: {:#}", e);
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let loader = ConfigLoader::from_default_location().context("loading configuration")?;
    let config = loader.get().await;

    init_logging(&config.logging).context("initialising logging")?;
    print_banner();
    info!("Starting Beacon job queue, version {}", env!("CARGO_PKG_VERSION"));
    print_startup_info(&config);

    let app = App::init(config).await.context("starting job queue")?;

    shutdown_signal().await;
    app.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
