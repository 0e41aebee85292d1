//! Layered engine configuration: defaults, then `huddle.toml`, then
//! `HUDDLE_*` environment variables.

use std::path::Path;
use std::path::PathBuf;

use config::Config;
use config::Environment;
use config::File;
use huddle_reconcile::ConflictStrategy;
use huddle_reconcile::MigrationOptions;
use huddle_retry::CircuitBreakerConfig;
use huddle_retry::RetryConfig;
use huddle_store::QueueConfig;
use huddle_store::SessionConfig;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Sync trigger timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period before a scheduled drain runs.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Per-attempt timeout for every server call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_debounce_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Root engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub migration: MigrationOptions,

    /// Strategy `reconcile` applies when profiles diverge.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));
        if self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be >= 1.0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.success_threshold == 0 {
            return invalid("circuit_breaker.success_threshold must be at least 1");
        }
        if self.session.session_timeout_ms <= 0 {
            return invalid("session.session_timeout_ms must be positive");
        }
        if self.session.total_steps == 0 {
            return invalid("session.total_steps must be at least 1");
        }
        if self.session.key_prefix.is_empty() {
            return invalid("session.key_prefix must not be empty");
        }
        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be at least 1");
        }
        if self.sync.request_timeout_ms == 0 {
            return invalid("sync.request_timeout_ms must be positive");
        }
        if self.migration.max_attempts == 0 {
            return invalid("migration.max_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Configuration loader with layered merging support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Defaults
    /// 2. Config file, if one was given
    /// 3. `HUDDLE_` environment variables, `__` between nested keys
    ///    (e.g. `HUDDLE_RETRY__MAX_RETRIES=5`)
    pub fn load(&self) -> Result<EngineConfig, ConfigError> {
        let defaults_json = serde_json::to_string(&EngineConfig::default())?;
        let mut builder = Config::builder().add_source(File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `./huddle.toml`, then `<config dir>/huddle/config.toml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./huddle.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }
        dirs::config_dir()
            .map(|dir| dir.join("huddle").join("config.toml"))
            .filter(|path| path.exists())
    }

    pub fn load_default() -> Result<EngineConfig, ConfigError> {
        let loader = match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }
}
