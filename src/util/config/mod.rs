//! fibra configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (FIBRA_LOG)
//! 3. Config file (fibra.toml)
//! 4. Default values
//! ```
//!
//! # Example file
//!
//! ```toml
//! [scheduler]
//! task_stack_size = 262144
//! task_name_prefix = "worker"
//!
//! [log]
//! level = "debug"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::{self, LogLevel};

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "fibra.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FibraConfig {
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogConfig {
    /// Minimum level printed
    #[serde(default)]
    pub level: LogLevel,
}

impl FibraConfig {
    /// Apply environment overrides.
    pub fn with_env(mut self) -> Self {
        if let Some(level) = logger::env_level() {
            self.log.level = level;
        }
        self
    }
}

/// Parse configuration from TOML text
pub fn from_toml_str(content: &str) -> Result<FibraConfig, ConfigError> {
    toml::from_str(content).map_err(ConfigError::ParseError)
}

/// Render configuration as TOML text
pub fn to_toml_string(config: &FibraConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(ConfigError::SerializeError)
}

/// Load configuration from `path`
/// Returns default config if file doesn't exist
pub fn load_config(path: &Path) -> Result<FibraConfig, ConfigError> {
    if !path.exists() {
        return Ok(FibraConfig::default());
    }

    let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
    from_toml_str(&content)
}

/// Save configuration to `path`
pub fn save_config(
    config: &FibraConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    let content = to_toml_string(config)?;
    fs::write(path, content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(toml::de::Error),
    SerializeError(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Config parse error: {}", e),
            ConfigError::SerializeError(e) => write!(f, "Config serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
