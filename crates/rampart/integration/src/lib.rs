//! Rampart integration layer
//!
//! Coordination between components that the watchdog protects:
//!
//! - [`EventBus`]: tenant-scoped publish/subscribe with strict per-tenant ordering
//! - [`TransactionCoordinator`]: transaction state machine and two-phase commit
//! - [`ConsistencyManager`]: validation, repair, monitoring and conflict resolution
//! - [`ServiceCommunicator`]: discovery, requests with retry, health, security
//! - [`CrossComponentIntegrator`]: propagation, sync, dependencies, error fan-out

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod consistency;
pub mod error;
pub mod event_bus;
pub mod integrator;
pub mod service;
pub mod transaction;

use std::sync::Arc;

use rampart_types::EscalationLog;
use rampart_watchdog::CascadingFailureDetector;

pub use config::{ConsistencyConfig, IntegrationConfig, IntegratorConfig, RetryPolicy, ServiceConfig};
pub use consistency::{
    ComponentDataSource, ConflictStrategy, ConsistencyConflict, ConsistencyManager, ConsistencyMonitor,
    ConsistencyRepair, ConsistencyStatus, ConsistencyValidation, EventualConsistencyRecord, FieldDifference,
    InMemoryDataSource, PropagationStatus, RepairAction, RepairStatus,
};
pub use error::{IntegrationError, Result};
pub use event_bus::{DeliveryFailure, DeliveryStatus, Event, EventBus, EventBusStats, EventCallback, Subscription};
pub use integrator::{
    ComponentState, CrossComponentError, CrossComponentIntegrator, DataSyncRecord, PropagatedEvent,
    StateCoordination, SyncStatus,
};
#[cfg(feature = "http")]
pub use service::HttpTransport;
pub use service::{
    HealthCheckResult, InMemoryTransport, PayloadEnvelope, SecurityContext, SecurityCredentials, SecurityLevel,
    ServiceCommunicator, ServiceEndpoint, ServiceRegistration, ServiceRegistry, ServiceRequest, ServiceResponse,
    ServiceState, Transport, TransportError, TransportResponse,
};
pub use transaction::{
    CommitParticipant, Coordination, CoordinationStatus, RecoveryOutcome, Transaction, TransactionCoordinator,
    TransactionRecovery, TransactionState, TwoPhaseOutcome,
};

/// The integration components wired to one bus, data source and escalation log.
#[derive(Clone)]
pub struct Integration {
    pub bus: Arc<EventBus>,
    pub transactions: Arc<TransactionCoordinator>,
    pub consistency: Arc<ConsistencyManager>,
    pub services: Arc<ServiceCommunicator>,
    pub integrator: Arc<CrossComponentIntegrator>,
}

impl Integration {
    pub fn new(
        config: IntegrationConfig,
        escalations: Arc<EscalationLog>,
        cascade: Arc<CascadingFailureDetector>,
        data: Arc<dyn ComponentDataSource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(escalations.clone()));
        let transactions = Arc::new(TransactionCoordinator::new(bus.clone(), escalations.clone()));
        let consistency = Arc::new(ConsistencyManager::new(
            config.consistency.clone(),
            data.clone(),
            escalations.clone(),
        ));
        let services = Arc::new(ServiceCommunicator::new(
            config.service.clone(),
            transport,
            escalations.clone(),
        ));
        let integrator = Arc::new(CrossComponentIntegrator::new(
            config.integrator,
            bus.clone(),
            data,
            cascade,
            escalations,
        ));

        Ok(Self {
            bus,
            transactions,
            consistency,
            services,
            integrator,
        })
    }
}
