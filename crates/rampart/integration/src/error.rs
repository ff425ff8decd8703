//! Error types for rampart-integration.

use rampart_types::{ComponentId, OrgId, RecordId, ServiceId, TransactionId};
use rampart_watchdog::WatchdogError;
use thiserror::Error;

use crate::transaction::TransactionState;

/// Errors raised by the integration layer.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// Transaction is not in a state that allows the requested action.
    #[error("cannot {action} transaction {id} in state {from}")]
    InvalidTransition {
        id: TransactionId,
        from: TransactionState,
        action: &'static str,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    #[error("security not configured for tenant {0}")]
    SecurityNotConfigured(OrgId),

    #[error("security context invalid: {0}")]
    SecurityInvalid(String),

    #[error("invalid payload envelope: {0}")]
    InvalidEnvelope(String),

    /// Adding the dependency would close a cycle.
    #[error("dependency {component} -> {depends_on} would create a cycle")]
    CircularDependency {
        component: ComponentId,
        depends_on: ComponentId,
    },

    #[error("validation not found: {0}")]
    ValidationNotFound(RecordId),

    #[error("monitor not found: {0}")]
    MonitorNotFound(RecordId),

    #[error("eventual consistency record not found: {0}")]
    EventualRecordNotFound(RecordId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data source error: {0}")]
    DataSource(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl IntegrationError {
    /// Whether the error is a synchronous validation failure that must not
    /// be retried.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            IntegrationError::Cancelled | IntegrationError::DataSource(_) | IntegrationError::Serialization(_)
        )
    }
}

/// Result type for integration operations.
pub type Result<T> = std::result::Result<T, IntegrationError>;
