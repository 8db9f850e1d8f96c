//! # Keel Worker
//!
//! Runs a worker pool, the stall detector and the periodic scheduler
//! against the configured job store until SIGINT or SIGTERM.

use keel_config::ConfigLoader;
use keel_core::{init_telemetry, shutdown_telemetry, KeelResult};
use keel_jobs::{cron_expressions, PeriodicTask};
use keel_server::app::AppBuilder;
use keel_server::startup::{install_metrics_exporter, print_banner, print_startup_info};
use keel_server::tasks::DemoSleep;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Tracing may not be up yet if configuration failed.
        eprintln!("keel-worker: {}", e);
        error!("Application error: {}", e);
        shutdown_telemetry();
        std::process::exit(1);
    }
    shutdown_telemetry();
}

async fn run() -> KeelResult<()> {
    let config_loader = ConfigLoader::from_default_location()?;
    let config = config_loader.get().await;

    init_telemetry(&config.telemetry_config())?;
    print_banner();
    info!("Starting Keel worker...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    install_metrics_exporter(&config.observability)?;
    print_startup_info(&config);

    let app = AppBuilder::new()
        .with_config(config)
        .with_periodic_task(
            PeriodicTask::for_task::<DemoSleep>("demo.tick", cron_expressions::EVERY_MINUTE)
                .map_err(keel_server::app::engine_error)?,
        )
        .build()
        .await?;

    let shutdown = app.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    app.run().await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
