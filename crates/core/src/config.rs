//! Configuration for a video core

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Core configuration
///
/// Every field has a default, so a TOML document only needs the keys it
/// overrides:
///
/// ```toml
/// hw_response_timeout_ms = 5000
/// max_load = 1000000
/// on_chip_memory = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bound on every wait for a hardware response, in milliseconds
    pub hw_response_timeout_ms: u64,

    /// Admission limit in load units (macroblocks per second), checked when a
    /// session loads resources
    pub max_load: Option<u64>,

    /// Observed fps must differ from the current value by more than this
    /// before votes are recomputed
    pub fps_deviation_threshold: u32,

    /// Frame rate assumed for sessions opened without one
    pub default_fps: u32,

    /// Engine has on-chip memory that must be allocated and voted for
    pub on_chip_memory: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hw_response_timeout_ms: 120_000,
            max_load: None,
            fps_deviation_threshold: 2,
            default_fps: 30,
            on_chip_memory: false,
        }
    }
}

impl CoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!("Loaded core config from {}", path.display());
        Ok(config)
    }

    /// Response timeout as a [`Duration`]
    pub fn hw_response_timeout(&self) -> Duration {
        Duration::from_millis(self.hw_response_timeout_ms)
    }

    /// Set the hardware response timeout
    pub fn with_hw_response_timeout(mut self, timeout: Duration) -> Self {
        self.hw_response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the admission limit
    pub fn with_max_load(mut self, load: u64) -> Self {
        self.max_load = Some(load);
        self
    }

    /// Set the fps deviation threshold
    pub fn with_fps_deviation_threshold(mut self, fps: u32) -> Self {
        self.fps_deviation_threshold = fps;
        self
    }

    /// Set the default frame rate
    pub fn with_default_fps(mut self, fps: u32) -> Self {
        self.default_fps = fps;
        self
    }

    /// Enable on-chip memory management
    pub fn with_on_chip_memory(mut self, enabled: bool) -> Self {
        self.on_chip_memory = enabled;
        self
    }
}
