//! Configuration for postbus processes.
//!
//! One YAML document covers every component; each section deserializes into
//! the config struct owned by that component's module.

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "postbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "POSTBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "POSTBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "POSTBUS_LOG";

use serde::Deserialize;

use crate::admission::RateLimitConfig;
use crate::broadcast::BroadcastConfig;
use crate::persister::PersisterConfig;
use crate::publisher::PublisherConfig;
use crate::queue::QueueConfig;
use crate::store::StoreConfig;

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Durable queue backend and delivery policy.
    pub queue: QueueConfig,
    /// Record store location and limits.
    pub store: StoreConfig,
    /// Broadcast/HTTP endpoint.
    pub broadcast: BroadcastConfig,
    /// Admission control for mutation-producing entry points.
    pub rate_limit: RateLimitConfig,
    pub publisher: PublisherConfig,
    pub persister: PersisterConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `postbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    ///    (e.g. `POSTBUS__QUEUE__MAX_REDELIVERIES=3`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
