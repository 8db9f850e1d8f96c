//! PostgreSQL backing for the job store.

mod store;

pub use store::PgJobStore;

use crate::error::{JobError, JobResult};
use keel_config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// Channel the `keel_jobs` trigger notifies on when work becomes ready.
pub const NOTIFY_CHANNEL: &str = "keel_jobs";

/// Creates a connection pool from configuration.
pub async fn create_pool(config: &DatabaseConfig) -> JobResult<PgPool> {
    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Connecting to PostgreSQL database..."
    );

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
        .connect(&config.url)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to connect to database");
            JobError::Database(e)
        })?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Applies the schema in `migrations/`.
pub async fn run_migrations(pool: &PgPool) -> JobResult<()> {
    info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}
