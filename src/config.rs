//! Configuration management for Turnstile.
//!
//! A policy file names every limiter the host will use. It is read once at
//! startup; policies never change while limiters are live.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::Policy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limiter policies by name
    #[serde(default)]
    pub policies: BTreeMap<String, Policy>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    ///
    /// `.json` files are read as JSON, anything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_json::from_str(json)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse policy file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every policy, naming the first invalid one.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.policies {
            policy.validate().map_err(|e| match e {
                TurnstileError::Config(msg) => {
                    TurnstileError::Config(format!("policy '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}
