//! Error types for rampart-watchdog.

use rampart_types::{ComponentId, HolderId, ResourceId};
use thiserror::Error;

/// Errors raised by the watchdog layer.
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// A cascading failure named a cause that never failed itself.
    #[error("unknown cause {cause} for component {component}: no prior failure recorded")]
    UnknownCause {
        component: ComponentId,
        cause: ComponentId,
    },

    /// A component cannot be its own cause.
    #[error("component {0} cannot cause its own failure")]
    SelfCause(ComponentId),

    /// The same wait cycle keeps coming back after recovery.
    #[error("unrecoverable deadlock between holders {holders:?}")]
    DeadlockUnrecoverable { holders: Vec<HolderId> },

    /// Contention on a resource outlasted the retry policy.
    #[error("race on resource {resource} persisted after {attempts} attempts")]
    RacePersistent { resource: ResourceId, attempts: u32 },

    /// The caller cancelled a guarded operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for watchdog operations.
pub type Result<T> = std::result::Result<T, WatchdogError>;
