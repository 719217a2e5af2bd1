//! Application configuration.
//!
//! Loaded from YAML files and `CALLWATCH__*` environment variables.

use std::collections::HashMap;

use serde::Deserialize;

use crate::interceptor::PublishPolicy;
use crate::publish::OverflowPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "callwatch.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CALLWATCH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CALLWATCH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CALLWATCH_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

/// Broker publishing settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Connection descriptor, `key=value` pairs separated by `;`.
    pub connection: String,
    /// Pre-provisioned exchange envelopes are written to.
    pub exchange: String,
    pub routing_key: String,
    pub publish_policy: PublishPolicy,
    pub queue: QueueConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            connection: "host=localhost;port=5672".to_string(),
            exchange: "telemetry".to_string(),
            routing_key: "telemetry.request".to_string(),
            publish_policy: PublishPolicy::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Optional bounded queue in front of the broker publisher.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 1024,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Sink selection for fan-out loggers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Providers used by categories with no explicit entry.
    pub default_sinks: Vec<String>,
    /// Category name to provider names.
    pub categories: HashMap<String, Vec<String>>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Each source below wins over the ones listed before it:
    /// 1. `callwatch.yaml` in the working directory, when present
    /// 2. the YAML file at `path`, which must exist when given
    /// 3. the YAML file named by `CONFIG_ENV_VAR`, when that variable is set
    /// 4. `CONFIG_ENV_PREFIX`-prefixed variables, with `__` between nested keys
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
