//! Configuration loader with layered sources.

use crate::{AppConfig, ConfigValidator};
use config::{Config, ConfigError, Environment, File};
use keel_core::KeelError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable selecting the environment overlay file.
pub const ENVIRONMENT_VAR: &str = "KEEL_ENVIRONMENT";

/// Prefix for environment variable overrides (`KEEL__WORKER__CONCURRENCY=4`).
pub const ENV_PREFIX: &str = "KEEL";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `KEEL__` prefix
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self, KeelError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, KeelError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration stays in place if the new one is invalid.
    pub async fn reload(&self) -> Result<(), KeelError> {
        let new_config = Self::load_config(&self.config_dir)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Gets a specific configuration value by dotted key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }

    fn load_config(config_dir: &Path) -> Result<AppConfig, KeelError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = config_dir.join(format!("{name}.toml"));
            if path.exists() {
                debug!("Loading config from: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.queues")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder
            .build()
            .and_then(Config::try_deserialize::<AppConfig>)
            .map_err(config_error_to_keel_error)?;

        ConfigValidator::validate(&app_config).map_err(|errors| {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            KeelError::Configuration(joined)
        })?;

        Ok(app_config)
    }
}

fn config_error_to_keel_error(err: ConfigError) -> KeelError {
    KeelError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_loads_default_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[database]
url = "memory://"

[worker]
concurrency = 3
queues = ["default", "emails"]

[retry]
max_attempts = 7
base_delay_secs = 0.5
"#,
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path()).unwrap();
        let config = loader.get().await;
        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.worker.queues, vec!["default", "emails"]);
        assert_eq!(config.retry.max_attempts, 7);
        // Unset fields in a partial section fall back to defaults.
        assert_eq!(config.worker.job_timeout_secs, 300);
        assert!((config.retry.max_delay_secs - 300.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_local_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[stall]\nthreshold_secs = 900\ncheck_interval_secs = 60\n",
        )
        .unwrap();
        fs::write(dir.path().join("local.toml"), "[stall]\nthreshold_secs = 1200\n").unwrap();

        let loader = ConfigLoader::new(dir.path()).unwrap();
        assert_eq!(loader.get_value::<u64>("stall.threshold_secs").await, Some(1200));
        assert_eq!(loader.get_value::<u64>("stall.check_interval_secs").await, Some(60));
        assert_eq!(loader.get_value::<u64>("stall.missing").await, None);
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.toml"), "[worker]\nconcurrency = 0\n").unwrap();

        let err = ConfigLoader::new(dir.path()).err().unwrap();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("concurrency"));
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        fs::write(&path, "[worker]\nconcurrency = 2\n").unwrap();

        let loader = ConfigLoader::new(dir.path()).unwrap();
        assert_eq!(loader.get().await.worker.concurrency, 2);

        fs::write(&path, "[worker]\nconcurrency = 4\n").unwrap();
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.worker.concurrency, 4);
    }
}
