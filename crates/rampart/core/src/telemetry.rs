//! Tracing initialization.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{RampartError, Result};

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output.
    pub json_format: bool,

    pub with_target: bool,

    pub with_thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_format: false,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_json_format(mut self) -> Self {
        self.json_format = true;
        self
    }

    /// The filter to install: `RUST_LOG` wins over the configured level.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.log_level)
                .map_err(|e| RampartError::Telemetry(format!("bad log level {:?}: {}", self.log_level, e))),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.env_filter()?);

    let installed = if config.json_format {
        let layer = fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .with_file(true)
            .with_line_number(true);
        subscriber.with(layer).try_init()
    } else {
        let layer = fmt::layer()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids);
        subscriber.with(layer).try_init()
    };

    installed.map_err(|e| RampartError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.json_format);
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_log_level("rampart=debug")
            .with_json_format();
        assert_eq!(config.log_level, "rampart=debug");
        assert!(config.json_format);
    }
}
