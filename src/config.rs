//! Backend configuration
//!
//! The host framework hands the backend a JSON document; nothing is read
//! from or written to disk.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse backend configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// NAS backend configuration.
///
/// Fields use `#[serde(default)]` so that adding new options
/// won't break existing configuration documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Server endpoint used by `open_default()`
    pub endpoint: String,

    /// Longest single event pump iteration, in milliseconds.
    /// Bounds how long `close()` waits for the pump to notice cancellation.
    pub event_poll_interval_ms: u64,

    /// Fixed output buffer size for the local server (None = device default)
    pub stream_buffer_frames: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "default".to_string(),
            event_poll_interval_ms: 50,
            stream_buffer_frames: None,
        }
    }
}

impl BackendConfig {
    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        log::debug!("Loaded backend configuration: {:?}", config);
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Event pump poll interval, never zero
    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms.max(1))
    }
}
