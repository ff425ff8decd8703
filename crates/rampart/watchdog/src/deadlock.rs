//! Deadlock detection over the wait-for graph.
//!
//! Locks are exclusive and re-entrant for their holder. A holder that cannot
//! get a lock records a wait edge with [`DeadlockDetector::request_lock`].
//! Detection builds the holder to holder wait-for graph and reports any
//! strongly connected component with more than one holder.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rampart_types::{Escalation, EscalationKind, EscalationLog, HolderId, LockId, OrgId, RecordId, ResourceId, Severity};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::DeadlockConfig;
use crate::error::{Result, WatchdogError};

/// A granted resource lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: ResourceId,
    pub holder_id: HolderId,
    pub lock_id: LockId,
    pub acquired_at: DateTime<Utc>,
    pub org_id: OrgId,
}

/// A holder waiting for a resource.
#[derive(Debug, Clone)]
pub struct WaitEdge {
    pub resource_id: ResourceId,
    pub holder_id: HolderId,
    pub requested_at: DateTime<Utc>,
    requested_instant: Instant,
}

/// Holders and resources that form one wait cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockCycle {
    /// Participating holders, sorted.
    pub holders: Vec<HolderId>,
    /// Resources held inside the cycle and awaited by another participant, sorted.
    pub resources: Vec<ResourceId>,
}

/// Result of a detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadlockStatus {
    None,
    Detected(DeadlockCycle),
}

impl DeadlockStatus {
    pub fn is_detected(&self) -> bool {
        matches!(self, DeadlockStatus::Detected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Recovered,
}

/// Record of a forced lock release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlockRecovery {
    pub recovery_id: RecordId,
    pub org_id: OrgId,
    pub status: RecoveryStatus,
    pub resources_released: Vec<ResourceId>,
    pub holders_released: Vec<HolderId>,
    /// Locks actually released.
    pub locks_released: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct TenantLocks {
    locks: HashMap<ResourceId, ResourceLock>,
    waits: Vec<WaitEdge>,
}

/// Tracks locks and waits per tenant and breaks wait cycles.
pub struct DeadlockDetector {
    config: DeadlockConfig,
    escalations: Arc<EscalationLog>,
    tables: Mutex<HashMap<OrgId, TenantLocks>>,
    history: RwLock<HashMap<OrgId, Vec<DeadlockRecovery>>>,
}

impl DeadlockDetector {
    pub fn new(config: DeadlockConfig, escalations: Arc<EscalationLog>) -> Self {
        Self {
            config,
            escalations,
            tables: Mutex::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire a lock. Re-entrant for the current holder; `None` when another
    /// holder has it.
    #[instrument(skip(self))]
    pub fn acquire_lock(&self, org_id: &OrgId, resource: &ResourceId, holder: &HolderId) -> Option<LockId> {
        let mut tables = self.tables.lock();
        let tenant = tables.entry(org_id.clone()).or_default();

        if let Some(existing) = tenant.locks.get(resource) {
            if &existing.holder_id == holder {
                return Some(existing.lock_id);
            }
            debug!(org_id = %org_id, resource = %resource, held_by = %existing.holder_id, "Lock busy");
            return None;
        }

        let lock = ResourceLock {
            resource_id: resource.clone(),
            holder_id: holder.clone(),
            lock_id: LockId::generate(),
            acquired_at: Utc::now(),
            org_id: org_id.clone(),
        };
        let lock_id = lock.lock_id;
        tenant.locks.insert(resource.clone(), lock);
        tenant
            .waits
            .retain(|w| !(&w.resource_id == resource && &w.holder_id == holder));

        debug!(org_id = %org_id, resource = %resource, holder = %holder, "Lock acquired");
        Some(lock_id)
    }

    /// Record that `holder` is waiting for `resource`. Duplicate requests keep
    /// the original request time.
    pub fn request_lock(&self, org_id: &OrgId, resource: &ResourceId, holder: &HolderId) {
        let mut tables = self.tables.lock();
        let tenant = tables.entry(org_id.clone()).or_default();

        let already_waiting = tenant
            .waits
            .iter()
            .any(|w| &w.resource_id == resource && &w.holder_id == holder);
        if already_waiting {
            return;
        }

        tenant.waits.push(WaitEdge {
            resource_id: resource.clone(),
            holder_id: holder.clone(),
            requested_at: Utc::now(),
            requested_instant: Instant::now(),
        });
        debug!(org_id = %org_id, resource = %resource, holder = %holder, "Lock requested");
    }

    /// Release a lock held by `holder`. Returns false if it holds no such lock.
    pub fn release_lock(&self, org_id: &OrgId, resource: &ResourceId, holder: &HolderId) -> bool {
        let mut tables = self.tables.lock();
        let Some(tenant) = tables.get_mut(org_id) else {
            return false;
        };

        match tenant.locks.get(resource) {
            Some(lock) if &lock.holder_id == holder => {}
            _ => return false,
        }

        tenant.locks.remove(resource);
        tenant
            .waits
            .retain(|w| !(&w.resource_id == resource && &w.holder_id == holder));
        debug!(org_id = %org_id, resource = %resource, holder = %holder, "Lock released");
        true
    }

    pub fn is_lock_held(&self, org_id: &OrgId, resource: &ResourceId, holder: &HolderId) -> bool {
        self.tables
            .lock()
            .get(org_id)
            .and_then(|tenant| tenant.locks.get(resource))
            .is_some_and(|lock| &lock.holder_id == holder)
    }

    pub fn lock_holder(&self, org_id: &OrgId, resource: &ResourceId) -> Option<HolderId> {
        self.tables
            .lock()
            .get(org_id)
            .and_then(|tenant| tenant.locks.get(resource))
            .map(|lock| lock.holder_id.clone())
    }

    /// Resources `holder` is currently waiting for.
    pub fn waiting_for(&self, org_id: &OrgId, holder: &HolderId) -> Vec<ResourceId> {
        self.tables
            .lock()
            .get(org_id)
            .map(|tenant| {
                tenant
                    .waits
                    .iter()
                    .filter(|w| &w.holder_id == holder)
                    .map(|w| w.resource_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Detect a wait cycle of any length.
    pub fn detect_deadlock(&self, org_id: &OrgId) -> DeadlockStatus {
        match self.detect_cycles(org_id).into_iter().next() {
            Some(cycle) => DeadlockStatus::Detected(cycle),
            None => DeadlockStatus::None,
        }
    }

    /// Every disjoint wait cycle, ordered by first holder.
    pub fn detect_cycles(&self, org_id: &OrgId) -> Vec<DeadlockCycle> {
        let tables = self.tables.lock();
        let Some(tenant) = tables.get(org_id) else {
            return Vec::new();
        };

        let mut graph: DiGraph<HolderId, ResourceId> = DiGraph::new();
        let mut nodes: HashMap<HolderId, NodeIndex> = HashMap::new();
        let mut node_for = |graph: &mut DiGraph<HolderId, ResourceId>, holder: &HolderId| -> NodeIndex {
            *nodes
                .entry(holder.clone())
                .or_insert_with(|| graph.add_node(holder.clone()))
        };

        // Waiting holder H awaits R held by K: edge H -> K labelled R.
        for wait in &tenant.waits {
            let Some(lock) = tenant.locks.get(&wait.resource_id) else {
                continue;
            };
            if lock.holder_id == wait.holder_id {
                continue;
            }
            let from = node_for(&mut graph, &wait.holder_id);
            let to = node_for(&mut graph, &lock.holder_id);
            graph.add_edge(from, to, wait.resource_id.clone());
        }

        let mut cycles: Vec<DeadlockCycle> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let members: BTreeSet<NodeIndex> = component.iter().copied().collect();
                let holders: BTreeSet<HolderId> =
                    component.iter().map(|idx| graph[*idx].clone()).collect();
                let resources: BTreeSet<ResourceId> = graph
                    .edge_indices()
                    .filter_map(|edge| {
                        let (a, b) = graph.edge_endpoints(edge)?;
                        (members.contains(&a) && members.contains(&b)).then(|| graph[edge].clone())
                    })
                    .collect();
                DeadlockCycle {
                    holders: holders.into_iter().collect(),
                    resources: resources.into_iter().collect(),
                }
            })
            .collect();

        cycles.sort_by(|a, b| a.holders.cmp(&b.holders));
        cycles
    }

    /// Release every lock on `resources` held by one of `holders` and drop
    /// those holders' wait edges.
    #[instrument(skip(self))]
    pub fn recover(&self, org_id: &OrgId, resources: &[ResourceId], holders: &[HolderId]) -> DeadlockRecovery {
        let locks_released = {
            let mut tables = self.tables.lock();
            let tenant = tables.entry(org_id.clone()).or_default();

            let before = tenant.locks.len();
            tenant.locks.retain(|resource, lock| {
                !(resources.contains(resource) && holders.contains(&lock.holder_id))
            });
            tenant.waits.retain(|w| !holders.contains(&w.holder_id));
            before - tenant.locks.len()
        };

        let recovery = DeadlockRecovery {
            recovery_id: RecordId::generate(),
            org_id: org_id.clone(),
            status: RecoveryStatus::Recovered,
            resources_released: resources.to_vec(),
            holders_released: holders.to_vec(),
            locks_released,
            timestamp: Utc::now(),
        };

        info!(
            org_id = %org_id,
            recovery_id = %recovery.recovery_id,
            locks_released = locks_released,
            "Deadlock recovered"
        );

        self.history
            .write()
            .entry(org_id.clone())
            .or_default()
            .push(recovery.clone());

        recovery
    }

    /// Detect and break one wait cycle.
    ///
    /// Recovery drops every lock and wait of the cycle's holders, so the same
    /// cycle cannot outlive it. A cycle whose holders were already recovered
    /// `max_recovery_attempts` times is escalated as unrecoverable instead.
    pub fn resolve(&self, org_id: &OrgId) -> Result<Option<DeadlockRecovery>> {
        let cycle = match self.detect_deadlock(org_id) {
            DeadlockStatus::None => return Ok(None),
            DeadlockStatus::Detected(cycle) => cycle,
        };

        let previous = self.recovery_count_for(org_id, &cycle.holders);
        if previous >= self.config.max_recovery_attempts {
            warn!(
                org_id = %org_id,
                holders = ?cycle.holders,
                previous_recoveries = previous,
                "Deadlock keeps recurring"
            );
            self.record_unrecoverable_deadlock(org_id, &cycle.resources);
            return Err(WatchdogError::DeadlockUnrecoverable {
                holders: cycle.holders,
            });
        }

        Ok(Some(self.recover(org_id, &cycle.resources, &cycle.holders)))
    }

    /// Raise a `deadlock_unrecoverable` escalation.
    pub fn record_unrecoverable_deadlock(&self, org_id: &OrgId, resources: &[ResourceId]) -> Escalation {
        let resources: Vec<&str> = resources.iter().map(|r| r.as_str()).collect();
        self.escalations.raise(
            org_id,
            EscalationKind::DeadlockUnrecoverable,
            Severity::Critical,
            json!({ "resources": resources }),
        )
    }

    /// Whether `holder` has waited on `resource` for longer than the lock timeout.
    pub fn has_wait_timed_out(&self, org_id: &OrgId, resource: &ResourceId, holder: &HolderId) -> bool {
        let timeout = self.config.lock_timeout();
        self.tables
            .lock()
            .get(org_id)
            .and_then(|tenant| {
                tenant
                    .waits
                    .iter()
                    .find(|w| &w.resource_id == resource && &w.holder_id == holder)
                    .map(|w| w.requested_instant.elapsed() > timeout)
            })
            .unwrap_or(false)
    }

    pub fn recovery_history(&self, org_id: &OrgId) -> Vec<DeadlockRecovery> {
        self.history.read().get(org_id).cloned().unwrap_or_default()
    }

    fn recovery_count_for(&self, org_id: &OrgId, holders: &[HolderId]) -> u32 {
        self.history
            .read()
            .get(org_id)
            .map_or(0, |list| {
                list.iter()
                    .filter(|r| {
                        let mut released = r.holders_released.clone();
                        released.sort();
                        released == holders
                    })
                    .count() as u32
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detector() -> (DeadlockDetector, Arc<EscalationLog>) {
        let log = Arc::new(EscalationLog::new());
        (DeadlockDetector::new(DeadlockConfig::default(), log.clone()), log)
    }

    fn r(name: &str) -> ResourceId {
        ResourceId::new(name)
    }

    fn h(name: &str) -> HolderId {
        HolderId::new(name)
    }

    #[test]
    fn test_acquire_is_reentrant_and_exclusive() {
        let (detector, _) = detector();
        let org = OrgId::new("org");

        let first = detector.acquire_lock(&org, &r("r1"), &h("a")).unwrap();
        assert_eq!(detector.acquire_lock(&org, &r("r1"), &h("a")), Some(first));
        assert_eq!(detector.acquire_lock(&org, &r("r1"), &h("b")), None);
        assert!(detector.is_lock_held(&org, &r("r1"), &h("a")));
    }

    #[test]
    fn test_release_only_by_holder() {
        let (detector, _) = detector();
        let org = OrgId::new("org");
        detector.acquire_lock(&org, &r("r1"), &h("a"));

        assert!(!detector.release_lock(&org, &r("r1"), &h("b")));
        assert!(detector.release_lock(&org, &r("r1"), &h("a")));
        assert!(!detector.release_lock(&org, &r("r1"), &h("a")));
        assert!(detector.acquire_lock(&org, &r("r1"), &h("b")).is_some());
    }

    #[test]
    fn test_two_party_deadlock() {
        let (detector, _) = detector();
        let org = OrgId::new("org");

        detector.acquire_lock(&org, &r("r1"), &h("a"));
        detector.acquire_lock(&org, &r("r2"), &h("b"));
        detector.request_lock(&org, &r("r2"), &h("a"));
        assert_eq!(detector.detect_deadlock(&org), DeadlockStatus::None);

        detector.request_lock(&org, &r("r1"), &h("b"));
        match detector.detect_deadlock(&org) {
            DeadlockStatus::Detected(cycle) => {
                assert_eq!(cycle.holders, vec![h("a"), h("b")]);
                assert_eq!(cycle.resources, vec![r("r1"), r("r2")]);
            }
            DeadlockStatus::None => panic!("expected deadlock"),
        }
    }

    #[test]
    fn test_three_party_deadlock() {
        let (detector, _) = detector();
        let org = OrgId::new("org");

        detector.acquire_lock(&org, &r("r1"), &h("a"));
        detector.acquire_lock(&org, &r("r2"), &h("b"));
        detector.acquire_lock(&org, &r("r3"), &h("c"));
        detector.request_lock(&org, &r("r2"), &h("a"));
        detector.request_lock(&org, &r("r3"), &h("b"));
        assert!(!detector.detect_deadlock(&org).is_detected());

        detector.request_lock(&org, &r("r1"), &h("c"));
        let status = detector.detect_deadlock(&org);
        assert!(status.is_detected());
        if let DeadlockStatus::Detected(cycle) = status {
            assert_eq!(cycle.holders.len(), 3);
        }
    }

    #[test]
    fn test_deadlock_is_tenant_scoped() {
        let (detector, _) = detector();
        let a = OrgId::new("org-a");
        let b = OrgId::new("org-b");

        detector.acquire_lock(&a, &r("r1"), &h("x"));
        detector.acquire_lock(&b, &r("r2"), &h("y"));
        detector.request_lock(&a, &r("r2"), &h("x"));
        detector.request_lock(&b, &r("r1"), &h("y"));

        assert!(!detector.detect_deadlock(&a).is_detected());
        assert!(!detector.detect_deadlock(&b).is_detected());
    }

    #[test]
    fn test_resolve_recovers_cycle() {
        let (detector, _) = detector();
        let org = OrgId::new("org");

        detector.acquire_lock(&org, &r("r1"), &h("a"));
        detector.acquire_lock(&org, &r("r2"), &h("b"));
        detector.request_lock(&org, &r("r2"), &h("a"));
        detector.request_lock(&org, &r("r1"), &h("b"));

        let recovery = detector.resolve(&org).unwrap().unwrap();
        assert_eq!(recovery.locks_released, 2);
        assert_eq!(recovery.status, RecoveryStatus::Recovered);
        assert!(!detector.detect_deadlock(&org).is_detected());
        assert!(detector.waiting_for(&org, &h("a")).is_empty());
        assert_eq!(detector.recovery_history(&org).len(), 1);
        assert!(detector.resolve(&org).unwrap().is_none());
    }

    #[test]
    fn test_resolve_breaks_one_cycle_at_a_time() {
        let (detector, log) = detector();
        let org = OrgId::new("org");

        for (resource, holder) in [("r1", "a"), ("r2", "b"), ("r3", "c"), ("r4", "d"), ("r5", "e")] {
            detector.acquire_lock(&org, &r(resource), &h(holder));
        }
        detector.request_lock(&org, &r("r2"), &h("a"));
        detector.request_lock(&org, &r("r1"), &h("b"));
        detector.request_lock(&org, &r("r4"), &h("c"));
        detector.request_lock(&org, &r("r3"), &h("d"));
        assert_eq!(detector.detect_cycles(&org).len(), 2);

        let first = detector.resolve(&org).unwrap().unwrap();
        assert_eq!(first.holders_released, vec![h("a"), h("b")]);
        assert!(!detector.is_lock_held(&org, &r("r1"), &h("a")));
        assert!(detector.is_lock_held(&org, &r("r3"), &h("c")));
        assert!(detector.is_lock_held(&org, &r("r5"), &h("e")));
        assert_eq!(detector.detect_cycles(&org).len(), 1);

        let second = detector.resolve(&org).unwrap().unwrap();
        assert_eq!(second.holders_released, vec![h("c"), h("d")]);
        assert!(detector.resolve(&org).unwrap().is_none());
        assert!(detector.is_lock_held(&org, &r("r5"), &h("e")));
        assert!(log.escalations(&org).is_empty());
    }

    #[test]
    fn test_recurring_deadlock_escalates() {
        let (detector, log) = detector();
        let org = OrgId::new("org");

        let recreate = || {
            detector.acquire_lock(&org, &r("r1"), &h("a"));
            detector.acquire_lock(&org, &r("r2"), &h("b"));
            detector.request_lock(&org, &r("r2"), &h("a"));
            detector.request_lock(&org, &r("r1"), &h("b"));
        };

        for _ in 0..DeadlockConfig::default().max_recovery_attempts {
            recreate();
            assert!(detector.resolve(&org).unwrap().is_some());
        }

        recreate();
        let err = detector.resolve(&org).unwrap_err();
        assert!(matches!(err, WatchdogError::DeadlockUnrecoverable { .. }));

        let escalations = log.escalations(&org);
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].kind, EscalationKind::DeadlockUnrecoverable);
        assert_eq!(escalations[0].severity, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let (detector, _) = detector();
        let org = OrgId::new("org");

        detector.acquire_lock(&org, &r("r1"), &h("a"));
        detector.request_lock(&org, &r("r1"), &h("b"));
        assert!(!detector.has_wait_timed_out(&org, &r("r1"), &h("b")));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(detector.has_wait_timed_out(&org, &r("r1"), &h("b")));
        assert!(!detector.has_wait_timed_out(&org, &r("r1"), &h("c")));
    }
}
