use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_NAME: &str = "strata.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// History configuration file format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Undo levels kept before the oldest are forgotten
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Events buffered per subscriber before slow subscribers start missing them
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_history_capacity() -> usize {
    100
}

fn default_event_buffer() -> usize {
    64
}

impl HistoryConfig {
    /// Load config from a directory, falling back to defaults when there is no config file
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_path = dir.as_ref().join(DEFAULT_CONFIG_NAME);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
                path: config_path.clone(),
                source,
            })?;
            let config = Self::from_json_str(&content)?;
            tracing::debug!("Loaded history config from {}", config_path.display());
            Ok(config)
        } else {
            Ok(HistoryConfig::default())
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: HistoryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("historyCapacity must be at least 1".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("eventBuffer must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            event_buffer: default_event_buffer(),
        }
    }
}
