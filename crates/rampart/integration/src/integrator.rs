//! Cross-component integration: event propagation, data sync, state
//! coordination, dependency management and error fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rampart_types::{ComponentId, EscalationKind, EscalationLog, EventId, OrgId, RecordId, Severity};
use rampart_watchdog::{CascadingFailureDetector, CircuitState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::IntegratorConfig;
use crate::consistency::ComponentDataSource;
use crate::error::{IntegrationError, Result};
use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Initializing,
    #[default]
    Ready,
    Degraded,
    Failed,
    Synchronized,
}

/// An event fanned out from one component to others over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagatedEvent {
    pub event_id: EventId,
    pub sequence: u64,
    pub org_id: OrgId,
    pub source: ComponentId,
    pub event_type: String,
    pub payload: Value,
    pub propagated_to: Vec<ComponentId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    /// Some keys had no value at the source.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSyncRecord {
    pub sync_id: RecordId,
    pub org_id: OrgId,
    pub source: ComponentId,
    pub target: ComponentId,
    pub keys: Vec<String>,
    pub synced_keys: Vec<String>,
    pub missing_keys: Vec<String>,
    pub status: SyncStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateCoordination {
    pub coordination_id: RecordId,
    pub org_id: OrgId,
    pub components: Vec<ComponentId>,
    pub state: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossComponentError {
    pub error_id: RecordId,
    pub org_id: OrgId,
    pub source: ComponentId,
    pub affected: Vec<ComponentId>,
    pub error_type: String,
    pub message: String,
    pub recovery_action: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub escalated: bool,
}

#[derive(Debug, Clone, Default)]
struct DependencyGraph {
    graph: DiGraph<ComponentId, ()>,
    nodes: HashMap<ComponentId, NodeIndex>,
}

impl DependencyGraph {
    fn node(&mut self, component: &ComponentId) -> NodeIndex {
        if let Some(&index) = self.nodes.get(component) {
            return index;
        }
        let index = self.graph.add_node(component.clone());
        self.nodes.insert(component.clone(), index);
        index
    }

    fn neighbors(&self, component: &ComponentId, direction: Direction) -> Vec<ComponentId> {
        let Some(&index) = self.nodes.get(component) else {
            return Vec::new();
        };
        let mut neighbors: Vec<ComponentId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        neighbors.sort();
        neighbors.dedup();
        neighbors
    }
}

#[derive(Default)]
struct TenantIntegration {
    events: Vec<PropagatedEvent>,
    syncs: Vec<DataSyncRecord>,
    coordinations: Vec<StateCoordination>,
    states: HashMap<ComponentId, ComponentState>,
    errors: Vec<CrossComponentError>,
}

pub struct CrossComponentIntegrator {
    config: IntegratorConfig,
    bus: Arc<EventBus>,
    data: Arc<dyn ComponentDataSource>,
    cascade: Arc<CascadingFailureDetector>,
    escalations: Arc<EscalationLog>,
    tenants: RwLock<HashMap<OrgId, TenantIntegration>>,
    graphs: Mutex<HashMap<OrgId, DependencyGraph>>,
}

impl CrossComponentIntegrator {
    pub fn new(
        config: IntegratorConfig,
        bus: Arc<EventBus>,
        data: Arc<dyn ComponentDataSource>,
        cascade: Arc<CascadingFailureDetector>,
        escalations: Arc<EscalationLog>,
    ) -> Self {
        Self {
            config,
            bus,
            data,
            cascade,
            escalations,
            tenants: RwLock::new(HashMap::new()),
            graphs: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event from `source` addressed to `targets`.
    #[instrument(skip(self, payload), fields(org_id = %org_id, source = %source))]
    pub fn propagate_event(
        &self,
        org_id: &OrgId,
        source: &ComponentId,
        targets: &[ComponentId],
        event_type: &str,
        payload: Value,
    ) -> PropagatedEvent {
        let event = self.bus.publish(
            org_id,
            event_type,
            json!({
                "source": source,
                "targets": targets,
                "payload": payload,
            }),
        );

        let propagated = PropagatedEvent {
            event_id: event.id,
            sequence: event.sequence,
            org_id: org_id.clone(),
            source: source.clone(),
            event_type: event_type.to_string(),
            payload,
            propagated_to: targets.to_vec(),
            timestamp: event.timestamp,
        };

        debug!(org_id = %org_id, source = %source, targets = targets.len(), sequence = event.sequence, "Event propagated");
        self.tenants
            .write()
            .entry(org_id.clone())
            .or_default()
            .events
            .push(propagated.clone());
        propagated
    }

    /// Propagated events, optionally only those addressed to `component`.
    pub fn propagated_events(&self, org_id: &OrgId, component: Option<&ComponentId>) -> Vec<PropagatedEvent> {
        self.tenants
            .read()
            .get(org_id)
            .map(|tenant| {
                tenant
                    .events
                    .iter()
                    .filter(|e| component.map_or(true, |c| e.propagated_to.contains(c)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy `keys` from `source` to `target` through the data source.
    pub fn synchronize_data(
        &self,
        org_id: &OrgId,
        source: &ComponentId,
        target: &ComponentId,
        keys: &[String],
    ) -> Result<DataSyncRecord> {
        let mut synced_keys = Vec::new();
        let mut missing_keys = Vec::new();
        for key in keys {
            match self.data.get(org_id, source, key)? {
                Some(value) => {
                    self.data.put(org_id, target, key, value)?;
                    synced_keys.push(key.clone());
                }
                None => missing_keys.push(key.clone()),
            }
        }

        let status = if missing_keys.is_empty() {
            SyncStatus::Completed
        } else {
            SyncStatus::Partial
        };
        let record = DataSyncRecord {
            sync_id: RecordId::generate(),
            org_id: org_id.clone(),
            source: source.clone(),
            target: target.clone(),
            keys: keys.to_vec(),
            synced_keys,
            missing_keys,
            status,
            timestamp: Utc::now(),
        };

        info!(
            org_id = %org_id,
            source = %source,
            target = %target,
            synced = record.synced_keys.len(),
            missing = record.missing_keys.len(),
            "Data synchronized"
        );
        self.tenants
            .write()
            .entry(org_id.clone())
            .or_default()
            .syncs
            .push(record.clone());
        Ok(record)
    }

    pub fn sync_status(&self, org_id: &OrgId, sync_id: RecordId) -> Option<DataSyncRecord> {
        self.tenants
            .read()
            .get(org_id)
            .and_then(|tenant| tenant.syncs.iter().find(|s| s.sync_id == sync_id).cloned())
    }

    /// Record a shared state and mark every component synchronized.
    pub fn coordinate_state(&self, org_id: &OrgId, components: &[ComponentId], state: Value) -> StateCoordination {
        let coordination = StateCoordination {
            coordination_id: RecordId::generate(),
            org_id: org_id.clone(),
            components: components.to_vec(),
            state,
            updated_at: Utc::now(),
        };

        let mut tenants = self.tenants.write();
        let tenant = tenants.entry(org_id.clone()).or_default();
        for component in components {
            tenant
                .states
                .insert(component.clone(), ComponentState::Synchronized);
        }
        tenant.coordinations.push(coordination.clone());

        info!(org_id = %org_id, components = components.len(), "State coordinated");
        coordination
    }

    pub fn coordinated_state(&self, org_id: &OrgId, coordination_id: RecordId) -> Option<StateCoordination> {
        self.tenants.read().get(org_id).and_then(|tenant| {
            tenant
                .coordinations
                .iter()
                .find(|c| c.coordination_id == coordination_id)
                .cloned()
        })
    }

    /// Declare that `component` depends on each of `depends_on`. A
    /// dependency that would close a cycle rejects the whole call and leaves
    /// the graph as it was.
    pub fn add_dependencies(&self, org_id: &OrgId, component: &ComponentId, depends_on: &[ComponentId]) -> Result<()> {
        let mut graphs = self.graphs.lock();
        let mut candidate = graphs.get(org_id).cloned().unwrap_or_default();

        let from = candidate.node(component);
        for dependency in depends_on {
            let to = candidate.node(dependency);
            candidate.graph.update_edge(from, to, ());
            if is_cyclic_directed(&candidate.graph) {
                warn!(org_id = %org_id, component = %component, depends_on = %dependency, "Rejected circular dependency");
                return Err(IntegrationError::CircularDependency {
                    component: component.clone(),
                    depends_on: dependency.clone(),
                });
            }
        }

        graphs.insert(org_id.clone(), candidate);
        debug!(org_id = %org_id, component = %component, count = depends_on.len(), "Dependencies added");
        Ok(())
    }

    /// Direct dependencies of a component.
    pub fn dependencies(&self, org_id: &OrgId, component: &ComponentId) -> Vec<ComponentId> {
        self.graphs
            .lock()
            .get(org_id)
            .map(|graph| graph.neighbors(component, Direction::Outgoing))
            .unwrap_or_default()
    }

    /// Components that directly depend on `component`.
    pub fn dependents(&self, org_id: &OrgId, component: &ComponentId) -> Vec<ComponentId> {
        self.graphs
            .lock()
            .get(org_id)
            .map(|graph| graph.neighbors(component, Direction::Incoming))
            .unwrap_or_default()
    }

    pub fn has_circular_dependency(&self, org_id: &OrgId) -> bool {
        self.graphs
            .lock()
            .get(org_id)
            .is_some_and(|graph| is_cyclic_directed(&graph.graph))
    }

    /// Components ordered so every dependency comes before its dependents.
    pub fn startup_order(&self, org_id: &OrgId) -> Vec<ComponentId> {
        let graphs = self.graphs.lock();
        let Some(graph) = graphs.get(org_id) else {
            return Vec::new();
        };
        match toposort(&graph.graph, None) {
            Ok(order) => order
                .into_iter()
                .rev()
                .map(|index| graph.graph[index].clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Fan an error out from `source` to the components it affects.
    ///
    /// The source gets a failure record and every affected component a
    /// cascading failure caused by it, so the cascade detector can contain
    /// the spread. Affected components are marked degraded.
    #[instrument(skip(self, message), fields(org_id = %org_id, source = %source))]
    pub fn handle_cross_component_error(
        &self,
        org_id: &OrgId,
        source: &ComponentId,
        affected: &[ComponentId],
        error_type: &str,
        message: &str,
        recovery_action: Option<&str>,
    ) -> Result<CrossComponentError> {
        self.cascade.record_failure(org_id, source, message);
        for component in affected.iter().filter(|c| *c != source) {
            self.cascade
                .record_cascading_failure(org_id, component, source, message)?;
        }

        let escalated = error_type == "critical" || affected.len() > self.config.escalation_affected_threshold;
        let error = CrossComponentError {
            error_id: RecordId::generate(),
            org_id: org_id.clone(),
            source: source.clone(),
            affected: affected.to_vec(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            recovery_action: recovery_action.map(str::to_string),
            timestamp: Utc::now(),
            escalated,
        };

        {
            let mut tenants = self.tenants.write();
            let tenant = tenants.entry(org_id.clone()).or_default();
            for component in affected {
                tenant.states.insert(component.clone(), ComponentState::Degraded);
            }
            tenant.errors.push(error.clone());
        }

        warn!(
            org_id = %org_id,
            source = %source,
            affected = affected.len(),
            error_type = %error_type,
            "Cross-component error"
        );

        self.bus.publish(
            org_id,
            "component.error",
            json!({
                "error_id": error.error_id.to_string(),
                "source": source,
                "affected": affected,
                "error_type": error_type,
                "message": message,
                "recovery_action": recovery_action,
            }),
        );

        if escalated {
            let severity = if error_type == "critical" {
                Severity::Critical
            } else {
                Severity::High
            };
            self.escalations.raise(
                org_id,
                EscalationKind::CrossComponentError,
                severity,
                json!({
                    "error_id": error.error_id.to_string(),
                    "source": source,
                    "affected": affected,
                    "error_type": error_type,
                    "message": message,
                }),
            );
        }

        Ok(error)
    }

    /// Errors where `component` was the source or among the affected.
    pub fn errors_for_component(&self, org_id: &OrgId, component: &ComponentId) -> Vec<CrossComponentError> {
        self.tenants
            .read()
            .get(org_id)
            .map(|tenant| {
                tenant
                    .errors
                    .iter()
                    .filter(|e| &e.source == component || e.affected.contains(component))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current state; components never seen read as ready.
    pub fn component_state(&self, org_id: &OrgId, component: &ComponentId) -> ComponentState {
        self.tenants
            .read()
            .get(org_id)
            .and_then(|tenant| tenant.states.get(component).copied())
            .unwrap_or_default()
    }

    pub fn set_component_state(&self, org_id: &OrgId, component: &ComponentId, state: ComponentState) {
        self.tenants
            .write()
            .entry(org_id.clone())
            .or_default()
            .states
            .insert(component.clone(), state);
    }

    /// Whether traffic may be routed to a component: it must not be
    /// isolated and its breaker must not be open.
    pub fn route_allowed(&self, org_id: &OrgId, component: &ComponentId) -> bool {
        !self.cascade.is_component_isolated(org_id, component)
            && self.cascade.circuit_state(org_id, component) != CircuitState::Open
    }
}
