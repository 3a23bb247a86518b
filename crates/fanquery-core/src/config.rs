//! Layered configuration for fanquery.
//!
//! Sources are merged in this order, later sources winning:
//! 1. Built-in defaults
//! 2. A TOML file (`fanquery.toml` by default)
//! 3. Environment variables prefixed with `FANQUERY_`, nested with `__`
//!    (for example `FANQUERY_CACHE__GC_TIME_MS=500`)

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fanquery.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FANQUERY_";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A source could not be read or extracted.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// A value is outside its accepted range.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },

    /// The configuration could not be rendered back to TOML.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),
}

/// Shared cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Delay before an unreferenced entry is dropped. `0` drops it immediately.
    pub gc_time_ms: u64,
    /// Age after which cached data is refetched when a new observer subscribes.
    pub stale_time_ms: u64,
    /// Fetches slower than this are logged at `warn`. `0` disables the check.
    pub slow_fetch_threshold_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_time_ms: 0,
            stale_time_ms: 0,
            slow_fetch_threshold_ms: 1_000,
        }
    }
}

impl CacheConfig {
    /// GC delay as a [`Duration`].
    #[must_use]
    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    /// Staleness window as a [`Duration`].
    #[must_use]
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    /// Slow fetch threshold, `None` when disabled.
    #[must_use]
    pub fn slow_fetch_threshold(&self) -> Option<Duration> {
        (self.slow_fetch_threshold_ms > 0)
            .then(|| Duration::from_millis(self.slow_fetch_threshold_ms))
    }
}

/// Batch coordinator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of descriptors accepted in one pass. Unlimited when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queries: Option<usize>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// Single-line output.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Logging settings, consumed by binaries that install a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `fanquery_core=debug`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanqueryConfig {
    /// Shared cache settings.
    pub cache: CacheConfig,
    /// Batch coordinator settings.
    pub batch: BatchConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl FanqueryConfig {
    /// Loads defaults, then `fanquery.toml` from the working directory if it
    /// exists, then `FANQUERY_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(Path::new(DEFAULT_CONFIG_FILE)))
    }

    /// Same as [`load`](Self::load) with an explicit TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Load(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::from_figment(Self::figment(path))
    }

    /// Parses a TOML string on top of the defaults, ignoring the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(content)),
        )
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_queries == Some(0) {
            return Err(ConfigError::Invalid {
                field: "batch.max_queries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "logging.level",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}
