//! Process startup utilities.

use keel_config::{AppConfig, ObservabilityConfig};
use keel_core::{KeelError, KeelResult};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    __ __          __
   / //_/__  ___  / /
  / ,< / _ \/ _ \/ /
 / /| /  __/  __/ /
/_/ |_\___/\___/_/

      background jobs
    "#);
}

/// Prints the effective runtime settings.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    let store = if config.database.is_memory() {
        "in-memory"
    } else {
        "postgres"
    };
    info!("{}", separator);
    info!("Store:        {}", store);
    info!("Queues:       {}", config.worker.queues.join(", "));
    info!("Concurrency:  {}", config.worker.concurrency);
    info!(
        "Stall check:  {} (threshold {}s)",
        if config.stall.enabled { "on" } else { "off" },
        config.stall.threshold_secs
    );
    info!(
        "Scheduler:    {}",
        if config.scheduler.enabled { "on" } else { "off" }
    );
    if config.observability.metrics_enabled {
        info!("Metrics:      http://{}/metrics", config.observability.metrics_addr);
    }
    info!("{}", separator);
}

/// Installs the Prometheus exporter when metrics are enabled.
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> KeelResult<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.metrics_addr.parse().map_err(|e| {
        KeelError::configuration(format!(
            "Invalid metrics address '{}': {}",
            config.metrics_addr, e
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| KeelError::internal(format!("Failed to install metrics exporter: {}", e)))?;

    keel_jobs::register_metrics();
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
