//! Leap configuration
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. Environment variables (LEAP_WORKERS, LEAP_LOG)
//! 2. File named by LEAP_CONFIG
//! 3. Default values
//! ```
//!
//! # Example
//!
//! ```toml
//! [runtime]
//! max_call_depth = 200
//!
//! [runtime.gc]
//! collection_threshold = 4096
//!
//! [scheduler]
//! core_workers = 4
//! max_workers = 64
//!
//! [log]
//! level = "debug"
//! ```

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::scheduler::SchedulerConfig;
use crate::runtime::RuntimeConfig;
use crate::util::logger::LogLevel;


/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "LEAP_CONFIG";
/// Environment variable overriding `scheduler.core_workers`.
pub const WORKERS_ENV: &str = "LEAP_WORKERS";
/// Environment variable overriding `log.level`.
pub const LOG_ENV: &str = "LEAP_LOG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeapConfig {
    /// Engine limits and collector settings
    pub runtime: RuntimeConfig,
    /// Worker pool settings
    pub scheduler: SchedulerConfig,
    /// Logging settings
    pub log: LogConfig,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value {value:?} for {name}")]
    InvalidOverride { name: &'static str, value: String },

    #[error("scheduler.max_workers ({max}) is below scheduler.core_workers ({core})")]
    WorkerBounds { core: usize, max: usize },
}

impl LeapConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LeapConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Defaults, then the file named by `LEAP_CONFIG`, then the
    /// `LEAP_WORKERS` and `LEAP_LOG` overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(
            std::env::var(WORKERS_ENV).ok().as_deref(),
            std::env::var(LOG_ENV).ok().as_deref(),
        )?;
        Ok(config)
    }

    /// Apply override values given as strings.
    pub fn apply_overrides(
        &mut self,
        workers: Option<&str>,
        level: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = workers {
            let workers = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| ConfigError::InvalidOverride {
                    name: WORKERS_ENV,
                    value: raw.to_string(),
                })?;
            self.scheduler.core_workers = workers;
            self.scheduler.max_workers = self.scheduler.max_workers.max(workers);
        }
        if let Some(raw) = level {
            self.log.level = raw.parse().map_err(|_| ConfigError::InvalidOverride {
                name: LOG_ENV,
                value: raw.to_string(),
            })?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (core, max) = (self.scheduler.core_workers, self.scheduler.max_workers);
        if max < core || max == 0 {
            return Err(ConfigError::WorkerBounds { core, max });
        }
        Ok(())
    }
}
