//! Configuration Module
//!
//! Provides TOML-based configuration for edgebridge with support for:
//! - Logging
//! - The local broker endpoint
//! - One bridge section per device connection
//! - Environment variable overrides (EDGEBRIDGE__* prefix)

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use bridge::{
    BridgeConfig, BridgeProtocol, BridgeTlsConfig, CalibrationConfig, ControlScope, LocalConfig,
};

mod bridge;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local broker endpoint
    pub local: LocalConfig,
    /// Bridge configurations
    pub bridge: Vec<BridgeConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `EDGEBRIDGE__` prefix with double underscores for nesting:
    ///    - `EDGEBRIDGE__LOCAL__HOST=mosquitto` overrides `local.host`
    ///    - `EDGEBRIDGE__LOG__LEVEL=debug` overrides `log.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let substituted = substitute_env_vars(&content)?;

        let cfg = config::Config::builder()
            // Start with defaults
            .set_default("log.level", default_log_level())?
            .set_default("local.host", "localhost")?
            .set_default("local.port", 1883)?
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            // Double underscore separates nested keys, single underscore preserved in field names
            .add_source(
                Environment::with_prefix("EDGEBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.local.validate().map_err(ConfigError::Validation)?;

        if self.bridge.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[bridge]] section is required".to_string(),
            ));
        }

        let mut connection_ids = HashSet::new();
        for bridge in &self.bridge {
            bridge.validate().map_err(|e| {
                ConfigError::Validation(format!("Bridge '{}': {}", bridge.name(), e))
            })?;

            if !connection_ids.insert(bridge.connection_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate bridge connection_id '{}'",
                    bridge.connection_id
                )));
            }
        }

        Ok(())
    }

    /// Bridges that should be started
    pub fn enabled_bridges(&self) -> impl Iterator<Item = &BridgeConfig> {
        self.bridge.iter().filter(|b| b.enabled)
    }
}
