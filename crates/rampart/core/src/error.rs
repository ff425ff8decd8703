//! Error types for the rampart facade.

use rampart_integration::IntegrationError;
use rampart_watchdog::WatchdogError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RampartError {
    /// Layered configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

pub type Result<T> = std::result::Result<T, RampartError>;
