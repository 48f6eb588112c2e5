//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// CAN binding configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// CAN driver to use, e.g. "socketcan".
    pub can_backend: String,
    /// Interface name within that driver, e.g. "vcan0".
    pub can_interface: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            can_backend: "socketcan".to_string(),
            can_interface: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
