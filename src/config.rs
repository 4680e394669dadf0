//! Runtime configuration types.

use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Whether allocation may trigger a collection (default: true)
    pub gc_enabled: bool,
    /// Allocations between automatic collections
    pub gc_threshold: usize,
    /// Log statistics after each collection
    pub gc_stats: bool,
    /// Stack size for execution-unit threads (None = platform default)
    pub unit_stack_size: Option<usize>,
    /// OS thread name prefix for execution units
    pub unit_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_enabled: true,
            gc_threshold: 1024,
            gc_stats: false,
            unit_stack_size: None,
            unit_name_prefix: "kiln-unit".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
