//! Rampart shared types
//!
//! Vocabulary used by every Rampart crate:
//!
//! - **Identifiers**: tenant, component, resource and record ids
//! - **Escalations**: the tenant-scoped audit trail of uncontained failures
//! - **Backoff**: the exponential retry policy and its cancellable runner

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod backoff;
pub mod escalation;
pub mod ids;

pub use backoff::{retry_with_backoff, BackoffPolicy, RetryDecision, RetryError};
pub use escalation::{
    Escalation, EscalationKind, EscalationLog, EscalationSink, MemoryEscalationSink, Severity,
    TenantEscalations,
};
pub use ids::*;
