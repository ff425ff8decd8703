//! Rampart resilience core
//!
//! One entry point over the watchdog and integration layers. A
//! [`ResilienceCore`] shares a single [`EscalationLog`] between every
//! detector and coordinator, so anything escalated anywhere shows up on one
//! tenant-scoped stream.
//!
//! ```no_run
//! use rampart::{RampartConfig, ResilienceCore};
//!
//! # fn main() -> rampart::Result<()> {
//! let config = RampartConfig::load(Some("rampart.toml"))?;
//! rampart::telemetry::init_tracing(&config.telemetry)?;
//! let _core = ResilienceCore::new(config)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod error;
pub mod telemetry;

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::{Profile, RampartConfig};
pub use error::{RampartError, Result};
pub use rampart_integration as integration;
pub use rampart_integration::{ComponentDataSource, InMemoryDataSource, InMemoryTransport, Integration, Transport};
pub use rampart_types as types;
pub use rampart_types::{Escalation, EscalationKind, EscalationLog, OrgId, Severity, TenantEscalations};
pub use rampart_watchdog as watchdog;
pub use rampart_watchdog::Watchdog;
pub use telemetry::{init_tracing, TelemetryConfig};

use rampart_integration::HealthCheckResult;
use rampart_types::RecordId;
use rampart_watchdog::SystemFailureOutcome;

/// The watchdog and integration layers wired to one escalation log.
pub struct ResilienceCore {
    config: RampartConfig,
    escalations: Arc<EscalationLog>,
    watchdog: Watchdog,
    integration: Integration,
    shutdown: CancellationToken,
    /// Children of `shutdown`, one per tenant that ran background work or failed.
    tenant_shutdown: DashMap<OrgId, CancellationToken>,
}

impl ResilienceCore {
    /// Build with an in-memory data source and scripted transport.
    pub fn new(config: RampartConfig) -> Result<Self> {
        Self::with_components(
            config,
            Arc::new(InMemoryDataSource::new()),
            Arc::new(InMemoryTransport::new()),
        )
    }

    pub fn with_components(
        config: RampartConfig,
        data: Arc<dyn ComponentDataSource>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let escalations = Arc::new(EscalationLog::new());
        let watchdog = Watchdog::new(config.watchdog.clone(), escalations.clone())?;
        let integration = Integration::new(
            config.integration.clone(),
            escalations.clone(),
            watchdog.cascade.clone(),
            data,
            transport,
        )?;

        info!(profile = ?config.profile, "Resilience core ready");

        Ok(Self {
            config,
            escalations,
            watchdog,
            integration,
            shutdown: CancellationToken::new(),
            tenant_shutdown: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RampartConfig {
        &self.config
    }

    pub fn escalations(&self) -> &Arc<EscalationLog> {
        &self.escalations
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn integration(&self) -> &Integration {
        &self.integration
    }

    /// Operator stream of every escalation raised from now on, all tenants.
    pub fn subscribe_escalations(&self) -> broadcast::Receiver<Escalation> {
        self.escalations.subscribe()
    }

    /// Escalations raised for one tenant from now on.
    pub fn subscribe_tenant_escalations(&self, org_id: &OrgId) -> TenantEscalations {
        self.escalations.subscribe_org(org_id)
    }

    /// Run a tenant's consistency monitor in the background until that
    /// tenant fails or the core shuts down.
    pub fn spawn_consistency_monitor(
        &self,
        org_id: &OrgId,
        monitor_id: RecordId,
    ) -> JoinHandle<rampart_integration::Result<u64>> {
        let consistency = self.integration.consistency.clone();
        let cancel = self.tenant_token(org_id).child_token();
        let org_id = org_id.clone();
        tokio::spawn(async move { consistency.run_monitor(&org_id, monitor_id, cancel).await })
    }

    /// Health-check every registered service of a tenant concurrently.
    pub async fn health_sweep(&self, org_id: &OrgId) -> Vec<HealthCheckResult> {
        let services = self.integration.services.list_services(org_id, None);
        let checks = services.iter().map(|endpoint| {
            self.integration
                .services
                .perform_health_check(org_id, endpoint.service_id())
        });
        join_all(checks).await
    }

    /// Handle a system-wide failure for a tenant: assess, shut the tenant
    /// down, plan recovery and escalate, then announce it, hold its event
    /// delivery and stop its background monitors. Other tenants keep running.
    pub fn handle_system_failure(&self, org_id: &OrgId, reason: &str) -> SystemFailureOutcome {
        let outcome = self.watchdog.system.handle_system_failure(org_id, reason);

        self.integration.bus.publish(
            org_id,
            "system.failure",
            json!({
                "reason": reason,
                "recovery_plan_id": outcome.plan.plan_id.to_string(),
                "escalation_id": outcome.escalation.id.to_string(),
            }),
        );
        self.integration.bus.pause(org_id);
        self.tenant_token(org_id).cancel();

        warn!(org_id = %org_id, reason = %reason, "System failure handled, delivery paused");
        outcome
    }

    /// Stop every tenant's background monitors.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether the tenant's background work has been stopped.
    pub fn is_tenant_shut_down(&self, org_id: &OrgId) -> bool {
        self.shutdown.is_cancelled()
            || self
                .tenant_shutdown
                .get(org_id)
                .is_some_and(|token| token.is_cancelled())
    }

    fn tenant_token(&self, org_id: &OrgId) -> CancellationToken {
        self.tenant_shutdown
            .entry(org_id.clone())
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }
}
