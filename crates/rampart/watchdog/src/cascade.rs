//! Cascading failure detection and containment.
//!
//! Every failure is appended to the tenant's failure log and fed to the
//! component's circuit breaker. Once two or more failures carry a cause, the
//! tenant is in a cascade: every involved component is forced open, marked
//! isolated and reported in a single `cascading_failure` escalation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rampart_types::{ComponentId, Escalation, EscalationKind, EscalationLog, OrgId, Severity};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::config::CircuitBreakerConfig;
use crate::error::{Result, WatchdogError};

/// Minimum number of caused failures that constitutes a cascade.
pub const CASCADE_THRESHOLD: usize = 2;

/// A single recorded component failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub component_id: ComponentId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub org_id: OrgId,
    /// Component whose failure caused this one.
    pub caused_by: Option<ComponentId>,
}

impl FailureRecord {
    pub fn is_cascading(&self) -> bool {
        self.caused_by.is_some()
    }
}

/// Tenant-scoped registry of isolated components.
#[derive(Default)]
pub struct IsolationRegistry {
    isolated: RwLock<HashMap<OrgId, HashMap<ComponentId, DateTime<Utc>>>>,
}

impl IsolationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Isolate a component. Returns false if it was already isolated.
    pub fn isolate(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        let mut isolated = self.isolated.write();
        let tenant = isolated.entry(org_id.clone()).or_default();
        if tenant.contains_key(component) {
            return false;
        }
        tenant.insert(component.clone(), Utc::now());
        true
    }

    pub fn is_isolated(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        self.isolated
            .read()
            .get(org_id)
            .is_some_and(|tenant| tenant.contains_key(component))
    }

    /// Release a component. Returns false if it was not isolated.
    pub fn release(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        self.isolated
            .write()
            .get_mut(org_id)
            .is_some_and(|tenant| tenant.remove(component).is_some())
    }

    /// Isolated components, sorted by id.
    pub fn components(&self, org_id: &OrgId) -> Vec<ComponentId> {
        let mut components: Vec<ComponentId> = self
            .isolated
            .read()
            .get(org_id)
            .map(|tenant| tenant.keys().cloned().collect())
            .unwrap_or_default();
        components.sort();
        components
    }

    pub fn isolated_at(&self, org_id: &OrgId, component: &ComponentId) -> Option<DateTime<Utc>> {
        self.isolated
            .read()
            .get(org_id)
            .and_then(|tenant| tenant.get(component).copied())
    }
}

/// Detects cascading failures and contains them.
pub struct CascadingFailureDetector {
    config: CircuitBreakerConfig,
    escalations: Arc<EscalationLog>,
    breakers: DashMap<(OrgId, ComponentId), Arc<CircuitBreaker>>,
    records: RwLock<HashMap<OrgId, Vec<FailureRecord>>>,
    isolation: IsolationRegistry,
    /// Components already covered by a cascade escalation, per tenant.
    contained: Mutex<HashMap<OrgId, HashSet<ComponentId>>>,
}

impl CascadingFailureDetector {
    pub fn new(config: CircuitBreakerConfig, escalations: Arc<EscalationLog>) -> Self {
        Self {
            config,
            escalations,
            breakers: DashMap::new(),
            records: RwLock::new(HashMap::new()),
            isolation: IsolationRegistry::new(),
            contained: Mutex::new(HashMap::new()),
        }
    }

    /// Record an independent component failure.
    #[instrument(skip(self, message))]
    pub fn record_failure(
        &self,
        org_id: &OrgId,
        component: &ComponentId,
        message: impl Into<String> + std::fmt::Debug,
    ) -> FailureRecord {
        let record = self.append(org_id, component, message.into(), None);
        self.breaker(org_id, component).record_failure();
        record
    }

    /// Record a failure caused by another component's failure.
    ///
    /// The cause must already have a failure of its own for this tenant.
    #[instrument(skip(self, message))]
    pub fn record_cascading_failure(
        &self,
        org_id: &OrgId,
        component: &ComponentId,
        caused_by: &ComponentId,
        message: impl Into<String> + std::fmt::Debug,
    ) -> Result<FailureRecord> {
        if component == caused_by {
            return Err(WatchdogError::SelfCause(component.clone()));
        }
        if !self.has_failure(org_id, caused_by) {
            return Err(WatchdogError::UnknownCause {
                component: component.clone(),
                cause: caused_by.clone(),
            });
        }

        let record = self.append(org_id, component, message.into(), Some(caused_by.clone()));
        self.breaker(org_id, component).record_failure();

        if self.is_cascade_detected(org_id) {
            self.contain(org_id);
        }

        Ok(record)
    }

    /// Record a successful operation against a component's breaker.
    pub fn record_success(&self, org_id: &OrgId, component: &ComponentId) {
        if let Some(breaker) = self.existing_breaker(org_id, component) {
            breaker.record_success();
        }
    }

    pub fn is_cascade_detected(&self, org_id: &OrgId) -> bool {
        self.records
            .read()
            .get(org_id)
            .map_or(0, |records| records.iter().filter(|r| r.is_cascading()).count())
            >= CASCADE_THRESHOLD
    }

    /// Force open and isolate every component involved in the tenant's
    /// failures. Returns the components that were newly isolated.
    pub fn isolate(&self, org_id: &OrgId) -> Vec<ComponentId> {
        self.involved_components(org_id)
            .into_iter()
            .filter(|component| self.isolate_component(org_id, component))
            .collect()
    }

    /// Raise a `cascading_failure` escalation describing the current cascade.
    pub fn escalate(&self, org_id: &OrgId) -> Escalation {
        let involved = self.involved_components(org_id);
        self.raise(org_id, &involved, &involved)
    }

    pub fn is_component_isolated(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        self.isolation.is_isolated(org_id, component)
    }

    /// Lift a component's isolation. The breaker is left as is.
    pub fn release_component(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        let released = self.isolation.release(org_id, component);
        if released {
            info!(org_id = %org_id, component = %component, "Component released from isolation");
        }
        released
    }

    pub fn isolated_components(&self, org_id: &OrgId) -> Vec<ComponentId> {
        self.isolation.components(org_id)
    }

    /// Breaker state, `Closed` for components that never failed.
    pub fn circuit_state(&self, org_id: &OrgId, component: &ComponentId) -> CircuitState {
        self.existing_breaker(org_id, component)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn allow_request(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        self.existing_breaker(org_id, component)
            .map_or(true, |b| b.allow_request())
    }

    pub fn breaker_stats(&self, org_id: &OrgId, component: &ComponentId) -> Option<CircuitBreakerStats> {
        self.existing_breaker(org_id, component).map(|b| b.stats())
    }

    /// Reset a component's breaker to closed.
    pub fn reset_breaker(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        match self.existing_breaker(org_id, component) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn failure_records(&self, org_id: &OrgId) -> Vec<FailureRecord> {
        self.records.read().get(org_id).cloned().unwrap_or_default()
    }

    /// Components with a failure record or named as a cause, sorted.
    pub fn involved_components(&self, org_id: &OrgId) -> Vec<ComponentId> {
        let records = self.records.read();
        let mut involved: Vec<ComponentId> = records
            .get(org_id)
            .map(|list| {
                list.iter()
                    .flat_map(|r| std::iter::once(&r.component_id).chain(r.caused_by.iter()))
                    .cloned()
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        involved.sort();
        involved
    }

    /// Length of the longest causal chain in the tenant's failures.
    pub fn cascade_depth(&self, org_id: &OrgId) -> usize {
        let records = self.records.read();
        let Some(list) = records.get(org_id) else {
            return 0;
        };

        let mut causes: HashMap<&ComponentId, Vec<&ComponentId>> = HashMap::new();
        for record in list {
            let entry = causes.entry(&record.component_id).or_default();
            if let Some(cause) = &record.caused_by {
                entry.push(cause);
            }
        }

        let mut memo: HashMap<&ComponentId, usize> = HashMap::new();
        let mut deepest = 0;
        for &component in causes.keys() {
            let mut visiting = HashSet::new();
            deepest = deepest.max(chain_length(component, &causes, &mut memo, &mut visiting));
        }
        deepest
    }

    fn append(
        &self,
        org_id: &OrgId,
        component: &ComponentId,
        message: String,
        caused_by: Option<ComponentId>,
    ) -> FailureRecord {
        let record = FailureRecord {
            component_id: component.clone(),
            message,
            timestamp: Utc::now(),
            org_id: org_id.clone(),
            caused_by,
        };

        warn!(
            org_id = %org_id,
            component = %component,
            caused_by = ?record.caused_by,
            "Component failure recorded"
        );

        self.records
            .write()
            .entry(org_id.clone())
            .or_default()
            .push(record.clone());

        record
    }

    fn has_failure(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        self.records
            .read()
            .get(org_id)
            .is_some_and(|records| records.iter().any(|r| &r.component_id == component))
    }

    /// Isolate and escalate the components not yet covered by a cascade
    /// escalation.
    fn contain(&self, org_id: &OrgId) {
        let involved = self.involved_components(org_id);

        let newly_involved: Vec<ComponentId> = {
            let mut contained = self.contained.lock();
            let tenant = contained.entry(org_id.clone()).or_default();
            involved
                .iter()
                .filter(|component| tenant.insert((*component).clone()))
                .cloned()
                .collect()
        };

        if newly_involved.is_empty() {
            debug!(org_id = %org_id, "Cascade already contained");
            return;
        }

        for component in &newly_involved {
            self.isolate_component(org_id, component);
        }

        self.raise(org_id, &involved, &newly_involved);
    }

    fn isolate_component(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        let breaker = self.breaker(org_id, component);
        if breaker.state() != CircuitState::Open {
            breaker.force_state(CircuitState::Open);
        }

        let isolated = self.isolation.isolate(org_id, component);
        if isolated {
            warn!(org_id = %org_id, component = %component, "Component isolated");
        }
        isolated
    }

    fn raise(&self, org_id: &OrgId, involved: &[ComponentId], newly: &[ComponentId]) -> Escalation {
        let as_strings = |ids: &[ComponentId]| -> Vec<String> {
            ids.iter().map(|c| c.as_str().to_string()).collect()
        };
        self.escalations.raise(
            org_id,
            EscalationKind::CascadingFailure,
            Severity::Critical,
            json!({
                "cascade_components": as_strings(involved),
                "newly_isolated": as_strings(newly),
                "cascade_depth": self.cascade_depth(org_id),
            }),
        )
    }

    fn breaker(&self, org_id: &OrgId, component: &ComponentId) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((org_id.clone(), component.clone()))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(component.clone(), self.config.clone())))
            .clone()
    }

    fn existing_breaker(&self, org_id: &OrgId, component: &ComponentId) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&(org_id.clone(), component.clone()))
            .map(|entry| entry.value().clone())
    }
}

fn chain_length<'a>(
    component: &'a ComponentId,
    causes: &HashMap<&'a ComponentId, Vec<&'a ComponentId>>,
    memo: &mut HashMap<&'a ComponentId, usize>,
    visiting: &mut HashSet<&'a ComponentId>,
) -> usize {
    if let Some(&known) = memo.get(component) {
        return known;
    }
    if !visiting.insert(component) {
        return 0;
    }

    let longest_cause = causes
        .get(component)
        .map(|list| {
            list.iter()
                .map(|&cause| chain_length(cause, causes, memo, visiting))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    visiting.remove(component);
    let length = longest_cause + 1;
    memo.insert(component, length);
    length
}
