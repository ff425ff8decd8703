//! Rampart watchdog layer
//!
//! Detects failures that can spread between components and contains them:
//!
//! - **Circuit breakers** per component, opened by repeated failures
//! - **Cascade containment**: isolation of every component in a causal chain
//! - **Deadlock detection** over the wait-for graph, with forced recovery
//! - **Race detection** on concurrent writes, with exponential backoff
//! - **System failure coordination**: shutdown, state preservation, recovery plans
//!
//! All state is tenant-scoped. Anything that cannot be contained locally is
//! raised on the shared [`EscalationLog`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod cascade;
pub mod circuit_breaker;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod race;
pub mod system;

use std::sync::Arc;

use rampart_types::EscalationLog;

pub use cascade::{CascadingFailureDetector, FailureRecord, IsolationRegistry};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::{CircuitBreakerConfig, DeadlockConfig, RaceConfig, RecoveryPlanConfig, WatchdogConfig};
pub use deadlock::{DeadlockCycle, DeadlockDetector, DeadlockRecovery, DeadlockStatus, ResourceLock};
pub use error::{Result, WatchdogError};
pub use race::{AccessAttempt, AccessOperation, RaceConditionMonitor};
pub use system::{
    PreservedState, RecoveryAction, RecoveryPlan, RecoveryStep, RootCauseReport, ShutdownRecord,
    SystemFailureCoordinator, SystemFailureOutcome,
};

/// The watchdog detectors wired to one escalation log.
#[derive(Clone)]
pub struct Watchdog {
    pub cascade: Arc<CascadingFailureDetector>,
    pub deadlock: Arc<DeadlockDetector>,
    pub race: Arc<RaceConditionMonitor>,
    pub system: Arc<SystemFailureCoordinator>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, escalations: Arc<EscalationLog>) -> Result<Self> {
        config.validate()?;

        let cascade = Arc::new(CascadingFailureDetector::new(
            config.circuit_breaker.clone(),
            escalations.clone(),
        ));
        let deadlock = Arc::new(DeadlockDetector::new(config.deadlock.clone(), escalations.clone()));
        let race = Arc::new(RaceConditionMonitor::new(config.race.clone(), escalations.clone()));
        let system = Arc::new(SystemFailureCoordinator::new(
            config.recovery,
            escalations,
            cascade.clone(),
            deadlock.clone(),
            race.clone(),
        ));

        Ok(Self {
            cascade,
            deadlock,
            race,
            system,
        })
    }
}
