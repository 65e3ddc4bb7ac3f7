use std::fs;
use std::path::{Path, PathBuf};
use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::DEFAULT_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Settings of one labeling session.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of prompt entries, seeds included
    pub capacity: usize,
    /// Detections scoring below this are never promoted to prompts
    pub promotion_confidence_floor: f32,
    /// Detections scoring below this are not reported by auto-labeling
    pub min_report_confidence: f32,
    /// Table width before the extractor has revealed its dimension
    pub embedding_dim: usize,
    /// Tries per entry batch before an extraction failure counts
    pub extraction_attempts: u32,
    /// Time box for a background rebuild; `None` waits indefinitely
    pub rebuild_timeout_ms: Option<u64>,
    /// Run the consistency checks in release builds too
    pub validate_every_mutation: bool,
    /// Buffered events per subscriber
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            promotion_confidence_floor: 0.8,
            min_report_confidence: 0.4,
            embedding_dim: 512,
            extraction_attempts: 2,
            rebuild_timeout_ms: None,
            validate_every_mutation: true,
            event_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_promotion_floor(mut self, floor: f32) -> Self {
        self.promotion_confidence_floor = floor;
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn with_rebuild_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rebuild_timeout_ms = Some(timeout_ms);
        self
    }

    /// Validates value ranges
    ///
    /// # Errors
    /// - `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.promotion_confidence_floor) {
            return Err(ConfigError::Invalid(format!(
                "promotion_confidence_floor must be within [0, 1], got {}",
                self.promotion_confidence_floor
            )));
        }
        if !(0.0..=1.0).contains(&self.min_report_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_report_confidence must be within [0, 1], got {}",
                self.min_report_confidence
            )));
        }
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be at least 1".into()));
        }
        if self.extraction_attempts == 0 {
            return Err(ConfigError::Invalid("extraction_attempts must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Reads and validates a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the default config file location
    pub fn default_path() -> PathBuf {
        // 1. Check environment variable
        if let Ok(path) = env::var("VISPROMPT_CONFIG") {
            return PathBuf::from(path);
        }

        // 2. Use platform-specific config directory
        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join("visprompt").join("config.json");
        }

        // 3. Fallback to user's home directory
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".config").join("visprompt").join("config.json");
        }

        env::temp_dir().join("visprompt").join("config.json")
    }

    /// Loads the file at [`default_path`](Self::default_path) if it exists, else defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            log::info!("Loading session config from {:?}", path);
            Self::from_json_file(&path)
        } else {
            log::info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }
}
