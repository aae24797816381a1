//! Configuration management for costwindow.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `COSTWINDOW__*` environment variables, e.g.
//! `COSTWINDOW__RATE_LIMITING__WINDOW_SECS=30`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{CostWindowError, Result};
use crate::ratelimit::{LimitSettings, DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_WINDOW_SECS};

/// Prefix of environment variable overrides.
const ENV_PREFIX: &str = "COSTWINDOW";

/// Main configuration for the costwindow service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostWindowConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Inline limits, used when no limits file is configured
    #[serde(default)]
    pub limits: LimitSettings,

    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,

    /// Minimum seconds between cost writes for one consumer
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: i64,

    /// Path to a YAML file with limit settings
    pub limits_path: Option<String>,

    /// Limits file reload interval in seconds
    #[serde(default = "default_reload_interval")]
    pub config_reload_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            flush_interval_secs: default_flush_interval(),
            limits_path: None,
            config_reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_window_secs() -> i64 {
    DEFAULT_WINDOW_SECS
}

fn default_flush_interval() -> i64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

fn default_reload_interval() -> u64 {
    60
}

/// Which store holds the window state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only correct for a single instance
    #[default]
    Memory,
    /// SQLite database shared by all instances on the host
    Sqlite,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database URL for the SQLite backend
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://costwindow.db".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CostWindowConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }

        let config: CostWindowConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CostWindowConfig =
            serde_yaml::from_str(yaml).map_err(|e| CostWindowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the type system cannot.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.window_secs <= 0 {
            return Err(CostWindowError::InvalidWindow(self.rate_limiting.window_secs));
        }
        if self.rate_limiting.flush_interval_secs < 0 {
            return Err(CostWindowError::Config(format!(
                "flush_interval_secs must not be negative, got {}",
                self.rate_limiting.flush_interval_secs
            )));
        }
        Ok(())
    }

    /// The limit settings in effect: the limits file if configured, else the inline limits.
    pub fn limit_settings(&self) -> Result<LimitSettings> {
        match &self.rate_limiting.limits_path {
            Some(path) => LimitSettings::from_file(path),
            None => Ok(self.limits.clone()),
        }
    }
}
