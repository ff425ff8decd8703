//! Cross-component data consistency.
//!
//! Component data is read and written through a [`ComponentDataSource`].
//! The manager validates that components agree on a set of keys, repairs
//! disagreements, runs periodic monitors, tracks eventual convergence and
//! resolves conflicting values by strategy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rampart_types::{ComponentId, EscalationKind, EscalationLog, OrgId, RecordId, Severity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ConsistencyConfig;
use crate::error::{IntegrationError, Result};

/// Read/write access to the data each component holds.
pub trait ComponentDataSource: Send + Sync {
    fn get(&self, org_id: &OrgId, component: &ComponentId, key: &str) -> Result<Option<Value>>;

    fn put(&self, org_id: &OrgId, component: &ComponentId, key: &str, value: Value) -> Result<()>;
}

/// Data source backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    data: DashMap<(OrgId, ComponentId, String), Value>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComponentDataSource for InMemoryDataSource {
    fn get(&self, org_id: &OrgId, component: &ComponentId, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .get(&(org_id.clone(), component.clone(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn put(&self, org_id: &OrgId, component: &ComponentId, key: &str, value: Value) -> Result<()> {
        self.data
            .insert((org_id.clone(), component.clone(), key.to_string()), value);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    Consistent,
    Inconsistent,
}

/// One disagreement between components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub key: String,
    /// The differing field for object values; `None` when whole values differ.
    pub field: Option<String>,
    /// Every component's value (`null` when absent).
    pub values: BTreeMap<ComponentId, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyValidation {
    pub validation_id: RecordId,
    pub org_id: OrgId,
    pub components: Vec<ComponentId>,
    pub keys: Vec<String>,
    pub status: ConsistencyStatus,
    pub differences: Vec<FieldDifference>,
    pub validated_at: DateTime<Utc>,
}

impl ConsistencyValidation {
    pub fn is_consistent(&self) -> bool {
        self.status == ConsistencyStatus::Consistent
    }
}

/// A value to write to one component during repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    pub component: ComponentId,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyRepair {
    pub repair_id: RecordId,
    pub org_id: OrgId,
    pub validation_id: RecordId,
    pub actions: Vec<RepairAction>,
    pub status: RepairStatus,
    /// Differences still present after the repair.
    pub remaining: Vec<FieldDifference>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyMonitor {
    pub monitor_id: RecordId,
    pub org_id: OrgId,
    pub components: Vec<ComponentId>,
    pub keys: Vec<String>,
    pub interval_secs: u64,
    pub checks: u64,
    pub violations_detected: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: DateTime<Utc>,
}

impl ConsistencyMonitor {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_check
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationStatus {
    Pending,
    Converged,
}

/// Convergence of one key from a source component to its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventualConsistencyRecord {
    pub record_id: RecordId,
    pub org_id: OrgId,
    pub source: ComponentId,
    pub key: String,
    pub targets: BTreeMap<ComponentId, PropagationStatus>,
    pub started_at: DateTime<Utc>,
    pub converged_at: Option<DateTime<Utc>>,
}

impl EventualConsistencyRecord {
    pub fn is_converged(&self) -> bool {
        self.targets.values().all(|s| *s == PropagationStatus::Converged)
    }

    pub fn convergence_time(&self) -> Option<chrono::Duration> {
        self.converged_at.map(|at| at - self.started_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Highest `updated_at` wins.
    LatestWins,
    /// First listed component wins.
    SourceWins,
    /// Field-level union; the higher `version` wins each field.
    Merge,
    /// Left for an operator.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyConflict {
    pub conflict_id: RecordId,
    pub org_id: OrgId,
    pub components: Vec<ComponentId>,
    pub key: String,
    pub values: BTreeMap<ComponentId, Value>,
    pub strategy: ConflictStrategy,
    pub resolved_value: Option<Value>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated: bool,
}

impl ConsistencyConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_value.is_some()
    }
}

#[derive(Default)]
struct TenantRecords {
    validations: HashMap<RecordId, ConsistencyValidation>,
    repairs: Vec<ConsistencyRepair>,
    eventual: HashMap<RecordId, EventualConsistencyRecord>,
    conflicts: Vec<ConsistencyConflict>,
}

pub struct ConsistencyManager {
    config: ConsistencyConfig,
    source: Arc<dyn ComponentDataSource>,
    records: RwLock<HashMap<OrgId, TenantRecords>>,
    monitors: DashMap<(OrgId, RecordId), ConsistencyMonitor>,
    escalations: Arc<EscalationLog>,
}

impl ConsistencyManager {
    pub fn new(
        config: ConsistencyConfig,
        source: Arc<dyn ComponentDataSource>,
        escalations: Arc<EscalationLog>,
    ) -> Self {
        Self {
            config,
            source,
            records: RwLock::new(HashMap::new()),
            monitors: DashMap::new(),
            escalations,
        }
    }

    pub fn data_source(&self) -> &Arc<dyn ComponentDataSource> {
        &self.source
    }

    /// Compare `keys` across `components` and record every difference.
    #[instrument(skip(self), fields(org_id = %org_id))]
    pub fn validate(&self, org_id: &OrgId, components: &[ComponentId], keys: &[String]) -> Result<ConsistencyValidation> {
        if components.is_empty() {
            return Err(IntegrationError::InvalidArgument("validation needs at least one component".into()));
        }

        let differences = self.differences(org_id, components, keys)?;
        let status = if differences.is_empty() {
            ConsistencyStatus::Consistent
        } else {
            ConsistencyStatus::Inconsistent
        };

        let validation = ConsistencyValidation {
            validation_id: RecordId::generate(),
            org_id: org_id.clone(),
            components: components.to_vec(),
            keys: keys.to_vec(),
            status,
            differences,
            validated_at: Utc::now(),
        };

        if validation.is_consistent() {
            debug!(org_id = %org_id, keys = keys.len(), "Components consistent");
        } else {
            warn!(
                org_id = %org_id,
                differences = validation.differences.len(),
                "Inconsistency detected"
            );
        }

        self.records
            .write()
            .entry(org_id.clone())
            .or_default()
            .validations
            .insert(validation.validation_id, validation.clone());
        Ok(validation)
    }

    pub fn validation(&self, org_id: &OrgId, validation_id: RecordId) -> Result<ConsistencyValidation> {
        self.records
            .read()
            .get(org_id)
            .and_then(|records| records.validations.get(&validation_id))
            .cloned()
            .ok_or(IntegrationError::ValidationNotFound(validation_id))
    }

    /// Apply `actions` through the data source and re-validate. Leftover
    /// differences fail the repair and escalate.
    pub fn repair(&self, org_id: &OrgId, validation_id: RecordId, actions: Vec<RepairAction>) -> Result<ConsistencyRepair> {
        let validation = self.validation(org_id, validation_id)?;

        for action in &actions {
            self.source
                .put(org_id, &action.component, &action.key, action.value.clone())?;
        }

        let remaining = self.differences(org_id, &validation.components, &validation.keys)?;
        let status = if remaining.is_empty() {
            RepairStatus::Completed
        } else {
            RepairStatus::Failed
        };

        let repair = ConsistencyRepair {
            repair_id: RecordId::generate(),
            org_id: org_id.clone(),
            validation_id,
            actions,
            status,
            remaining,
            completed_at: Utc::now(),
        };

        match repair.status {
            RepairStatus::Completed => {
                info!(org_id = %org_id, validation = %validation_id, actions = repair.actions.len(), "Inconsistency repaired");
            }
            RepairStatus::Failed => {
                self.escalations.raise(
                    org_id,
                    EscalationKind::ConsistencyConflict,
                    Severity::High,
                    json!({
                        "validation_id": validation_id.to_string(),
                        "remaining_differences": repair.remaining.len(),
                        "keys": validation.keys,
                    }),
                );
            }
        }

        self.records
            .write()
            .entry(org_id.clone())
            .or_default()
            .repairs
            .push(repair.clone());
        Ok(repair)
    }

    pub fn repairs(&self, org_id: &OrgId) -> Vec<ConsistencyRepair> {
        self.records
            .read()
            .get(org_id)
            .map(|records| records.repairs.clone())
            .unwrap_or_default()
    }

    /// Register a periodic check. It is due immediately.
    pub fn monitor(
        &self,
        org_id: &OrgId,
        components: Vec<ComponentId>,
        keys: Vec<String>,
        interval: Option<Duration>,
    ) -> Result<ConsistencyMonitor> {
        let interval = interval.unwrap_or_else(|| self.config.default_monitor_interval());
        if interval.as_secs() == 0 {
            return Err(IntegrationError::InvalidArgument("monitor interval must be at least one second".into()));
        }
        if components.is_empty() {
            return Err(IntegrationError::InvalidArgument("monitor needs at least one component".into()));
        }

        let monitor = ConsistencyMonitor {
            monitor_id: RecordId::generate(),
            org_id: org_id.clone(),
            components,
            keys,
            interval_secs: interval.as_secs(),
            checks: 0,
            violations_detected: 0,
            last_check: None,
            next_check: Utc::now(),
        };
        self.monitors
            .insert((org_id.clone(), monitor.monitor_id), monitor.clone());

        info!(org_id = %org_id, monitor = %monitor.monitor_id, interval_secs = monitor.interval_secs, "Consistency monitor registered");
        Ok(monitor)
    }

    pub fn monitors(&self, org_id: &OrgId) -> Vec<ConsistencyMonitor> {
        self.monitors
            .iter()
            .filter(|entry| &entry.org_id == org_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Run every monitor of the tenant whose next check is due.
    pub fn run_due_monitors(&self, org_id: &OrgId) -> Result<Vec<ConsistencyValidation>> {
        let now = Utc::now();
        let due: Vec<RecordId> = self
            .monitors
            .iter()
            .filter(|entry| &entry.org_id == org_id && entry.is_due(now))
            .map(|entry| entry.monitor_id)
            .collect();

        due.into_iter()
            .map(|monitor_id| self.check_monitor(org_id, monitor_id))
            .collect()
    }

    /// Check a tenant's monitor on its interval until `cancel` fires.
    /// Returns the number of checks run.
    pub async fn run_monitor(&self, org_id: &OrgId, monitor_id: RecordId, cancel: CancellationToken) -> Result<u64> {
        let interval = self
            .monitors
            .get(&(org_id.clone(), monitor_id))
            .map(|monitor| monitor.interval())
            .ok_or(IntegrationError::MonitorNotFound(monitor_id))?;

        let mut ticker = tokio::time::interval(interval);
        let mut checks = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(org_id = %org_id, monitor = %monitor_id, checks = checks, "Consistency monitor stopped");
                    return Ok(checks);
                }
                _ = ticker.tick() => {
                    self.check_monitor(org_id, monitor_id)?;
                    checks += 1;
                }
            }
        }
    }

    /// Start tracking convergence of `key` from `source` to `targets`.
    pub fn track_eventual_consistency(
        &self,
        org_id: &OrgId,
        source: &ComponentId,
        targets: &[ComponentId],
        key: &str,
    ) -> Result<EventualConsistencyRecord> {
        let mut record = EventualConsistencyRecord {
            record_id: RecordId::generate(),
            org_id: org_id.clone(),
            source: source.clone(),
            key: key.to_string(),
            targets: targets
                .iter()
                .map(|t| (t.clone(), PropagationStatus::Pending))
                .collect(),
            started_at: Utc::now(),
            converged_at: None,
        };
        self.update_convergence(&mut record)?;

        self.records
            .write()
            .entry(org_id.clone())
            .or_default()
            .eventual
            .insert(record.record_id, record.clone());
        Ok(record)
    }

    /// Re-read the targets of a tracked key.
    pub fn refresh_convergence(&self, org_id: &OrgId, record_id: RecordId) -> Result<EventualConsistencyRecord> {
        let mut record = self
            .records
            .read()
            .get(org_id)
            .and_then(|records| records.eventual.get(&record_id))
            .cloned()
            .ok_or(IntegrationError::EventualRecordNotFound(record_id))?;

        self.update_convergence(&mut record)?;

        if let Some(records) = self.records.write().get_mut(org_id) {
            records.eventual.insert(record_id, record.clone());
        }
        Ok(record)
    }

    /// Resolve differing values of `key` across `components`.
    #[instrument(skip(self, values), fields(org_id = %org_id, key = %key))]
    pub fn resolve_conflict(
        &self,
        org_id: &OrgId,
        components: &[ComponentId],
        key: &str,
        values: BTreeMap<ComponentId, Value>,
        strategy: ConflictStrategy,
    ) -> ConsistencyConflict {
        let resolved_value = match strategy {
            ConflictStrategy::LatestWins => latest_value(components, &values),
            ConflictStrategy::SourceWins => components.iter().find_map(|c| values.get(c).cloned()),
            ConflictStrategy::Merge => merge_values(components, &values),
            ConflictStrategy::Manual => None,
        };

        let mut conflict = ConsistencyConflict {
            conflict_id: RecordId::generate(),
            org_id: org_id.clone(),
            components: components.to_vec(),
            key: key.to_string(),
            values,
            strategy,
            resolved_at: resolved_value.as_ref().map(|_| Utc::now()),
            resolved_value,
            escalated: false,
        };

        if conflict.is_resolved() {
            info!(org_id = %org_id, key = %key, strategy = ?strategy, "Conflict resolved");
        } else {
            conflict.escalated = true;
            self.escalations.raise(
                org_id,
                EscalationKind::ConsistencyConflict,
                Severity::High,
                json!({
                    "conflict_id": conflict.conflict_id.to_string(),
                    "key": key,
                    "strategy": strategy,
                    "components": conflict.components,
                }),
            );
        }

        self.records
            .write()
            .entry(org_id.clone())
            .or_default()
            .conflicts
            .push(conflict.clone());
        conflict
    }

    pub fn conflicts(&self, org_id: &OrgId) -> Vec<ConsistencyConflict> {
        self.records
            .read()
            .get(org_id)
            .map(|records| records.conflicts.clone())
            .unwrap_or_default()
    }

    fn check_monitor(&self, org_id: &OrgId, monitor_id: RecordId) -> Result<ConsistencyValidation> {
        let key = (org_id.clone(), monitor_id);
        let (components, keys) = self
            .monitors
            .get(&key)
            .map(|m| (m.components.clone(), m.keys.clone()))
            .ok_or(IntegrationError::MonitorNotFound(monitor_id))?;

        let validation = self.validate(org_id, &components, &keys)?;

        if let Some(mut monitor) = self.monitors.get_mut(&key) {
            let now = Utc::now();
            monitor.checks += 1;
            if !validation.is_consistent() {
                monitor.violations_detected += 1;
            }
            monitor.last_check = Some(now);
            monitor.next_check = now + chrono::Duration::seconds(monitor.interval_secs as i64);
        }
        Ok(validation)
    }

    fn update_convergence(&self, record: &mut EventualConsistencyRecord) -> Result<()> {
        let expected = self.source.get(&record.org_id, &record.source, &record.key)?;
        for (target, status) in record.targets.iter_mut() {
            let actual = self.source.get(&record.org_id, target, &record.key)?;
            *status = if expected.is_some() && actual == expected {
                PropagationStatus::Converged
            } else {
                PropagationStatus::Pending
            };
        }

        if record.is_converged() && record.converged_at.is_none() {
            record.converged_at = Some(Utc::now());
            info!(org_id = %record.org_id, key = %record.key, targets = record.targets.len(), "Key converged");
        } else if !record.is_converged() {
            record.converged_at = None;
        }
        Ok(())
    }

    fn differences(&self, org_id: &OrgId, components: &[ComponentId], keys: &[String]) -> Result<Vec<FieldDifference>> {
        let mut differences = Vec::new();

        for key in keys {
            let mut values = BTreeMap::new();
            for component in components {
                let value = self.source.get(org_id, component, key)?.unwrap_or(Value::Null);
                values.insert(component.clone(), value);
            }

            let all_objects = values.values().all(Value::is_object);
            if all_objects {
                let fields: BTreeSet<&String> = values
                    .values()
                    .filter_map(Value::as_object)
                    .flat_map(|object| object.keys())
                    .collect();

                for field in fields {
                    let per_component: BTreeMap<ComponentId, Value> = values
                        .iter()
                        .map(|(component, value)| {
                            (component.clone(), value.get(field.as_str()).cloned().unwrap_or(Value::Null))
                        })
                        .collect();
                    if !all_equal(per_component.values()) {
                        differences.push(FieldDifference {
                            key: key.clone(),
                            field: Some(field.clone()),
                            values: per_component,
                        });
                    }
                }
            } else if !all_equal(values.values()) {
                differences.push(FieldDifference {
                    key: key.clone(),
                    field: None,
                    values,
                });
            }
        }

        Ok(differences)
    }
}

fn all_equal<'a>(mut values: impl Iterator<Item = &'a Value>) -> bool {
    match values.next() {
        Some(first) => values.all(|v| v == first),
        None => true,
    }
}

/// `updated_at` as milliseconds, from an RFC 3339 string or an integer.
fn updated_at(value: &Value) -> Option<i64> {
    match value.get("updated_at")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn version(value: &Value) -> u64 {
    value.get("version").and_then(Value::as_u64).unwrap_or(0)
}

// A tie at the newest timestamp with differing values cannot be decided.
fn latest_value(components: &[ComponentId], values: &BTreeMap<ComponentId, Value>) -> Option<Value> {
    let candidates: Vec<&Value> = components.iter().filter_map(|c| values.get(c)).collect();
    let newest = candidates.iter().map(|v| updated_at(v)).max()??;
    let winners: Vec<&Value> = candidates
        .into_iter()
        .filter(|v| updated_at(v) == Some(newest))
        .collect();

    if all_equal(winners.iter().copied()) {
        winners.first().map(|v| (*v).clone())
    } else {
        None
    }
}

fn merge_values(components: &[ComponentId], values: &BTreeMap<ComponentId, Value>) -> Option<Value> {
    let objects: Vec<(&Map<String, Value>, u64)> = components
        .iter()
        .filter_map(|c| values.get(c))
        .map(|v| v.as_object().map(|o| (o, version(v))))
        .collect::<Option<Vec<_>>>()?;
    if objects.is_empty() {
        return None;
    }

    let mut merged = Map::new();
    let mut merged_from: HashMap<String, u64> = HashMap::new();
    for (object, object_version) in &objects {
        for (field, value) in object.iter() {
            // Strictly higher version replaces; ties keep the earlier component.
            let replace = merged_from
                .get(field)
                .map_or(true, |current| object_version > current);
            if replace {
                merged.insert(field.clone(), value.clone());
                merged_from.insert(field.clone(), *object_version);
            }
        }
    }

    if let Some(max_version) = objects.iter().map(|(_, v)| *v).max() {
        if merged.contains_key("version") {
            merged.insert("version".to_string(), json!(max_version));
        }
    }
    Some(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<ConsistencyManager>, Arc<InMemoryDataSource>, Arc<EscalationLog>) {
        let log = Arc::new(EscalationLog::new());
        let source = Arc::new(InMemoryDataSource::new());
        let manager = Arc::new(ConsistencyManager::new(
            ConsistencyConfig::default(),
            source.clone(),
            log.clone(),
        ));
        (manager, source, log)
    }

    fn components() -> Vec<ComponentId> {
        vec![ComponentId::new("a"), ComponentId::new("b")]
    }

    #[test]
    fn test_validate_consistent() {
        let (manager, source, _) = manager();
        let org = OrgId::new("org");
        for c in components() {
            source.put(&org, &c, "user:1", json!({ "name": "ada" })).unwrap();
        }

        let validation = manager
            .validate(&org, &components(), &["user:1".to_string()])
            .unwrap();
        assert!(validation.is_consistent());
        assert!(validation.differences.is_empty());
    }

    #[test]
    fn test_validate_reports_field_differences() {
        let (manager, source, _) = manager();
        let org = OrgId::new("org");
        source
            .put(&org, &ComponentId::new("a"), "user:1", json!({ "name": "ada", "tier": 1 }))
            .unwrap();
        source
            .put(&org, &ComponentId::new("b"), "user:1", json!({ "name": "ada", "tier": 2, "extra": true }))
            .unwrap();

        let validation = manager
            .validate(&org, &components(), &["user:1".to_string()])
            .unwrap();
        assert_eq!(validation.status, ConsistencyStatus::Inconsistent);

        let fields: Vec<Option<String>> = validation.differences.iter().map(|d| d.field.clone()).collect();
        assert_eq!(fields, vec![Some("extra".to_string()), Some("tier".to_string())]);
        assert_eq!(validation.differences[0].values[&ComponentId::new("a")], Value::Null);
    }

    #[test]
    fn test_validate_whole_values() {
        let (manager, source, _) = manager();
        let org = OrgId::new("org");
        source.put(&org, &ComponentId::new("a"), "count", json!(3)).unwrap();
        source.put(&org, &ComponentId::new("b"), "count", json!(4)).unwrap();

        let validation = manager.validate(&org, &components(), &["count".to_string()]).unwrap();
        assert_eq!(validation.differences.len(), 1);
        assert_eq!(validation.differences[0].field, None);
    }

    #[test]
    fn test_repair_and_failed_repair() {
        let (manager, source, log) = manager();
        let org = OrgId::new("org");
        source.put(&org, &ComponentId::new("a"), "k", json!(1)).unwrap();
        source.put(&org, &ComponentId::new("b"), "k", json!(2)).unwrap();
        let keys = vec!["k".to_string()];

        let validation = manager.validate(&org, &components(), &keys).unwrap();

        let failed = manager.repair(&org, validation.validation_id, vec![]).unwrap();
        assert_eq!(failed.status, RepairStatus::Failed);
        assert_eq!(log.escalations_of_kind(&org, EscalationKind::ConsistencyConflict).len(), 1);

        let repaired = manager
            .repair(
                &org,
                validation.validation_id,
                vec![RepairAction {
                    component: ComponentId::new("b"),
                    key: "k".into(),
                    value: json!(1),
                }],
            )
            .unwrap();
        assert_eq!(repaired.status, RepairStatus::Completed);
        assert!(manager.validate(&org, &components(), &keys).unwrap().is_consistent());
    }

    #[test]
    fn test_repair_unknown_validation() {
        let (manager, _, _) = manager();
        let err = manager
            .repair(&OrgId::new("org"), RecordId::generate(), vec![])
            .unwrap_err();
        assert!(matches!(err, IntegrationError::ValidationNotFound(_)));
    }

    #[test]
    fn test_run_due_monitors() {
        let (manager, source, _) = manager();
        let org = OrgId::new("org");
        source.put(&org, &ComponentId::new("a"), "k", json!(1)).unwrap();

        manager
            .monitor(&org, components(), vec!["k".into()], Some(Duration::from_secs(60)))
            .unwrap();

        let first = manager.run_due_monitors(&org).unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].is_consistent());
        assert!(manager.run_due_monitors(&org).unwrap().is_empty());
        assert!(manager.run_due_monitors(&OrgId::new("other")).unwrap().is_empty());

        let monitor = &manager.monitors(&org)[0];
        assert_eq!(monitor.checks, 1);
        assert_eq!(monitor.violations_detected, 1);
    }

    #[test]
    fn test_monitor_rejects_zero_interval() {
        let (manager, _, _) = manager();
        assert!(manager
            .monitor(&OrgId::new("org"), components(), vec![], Some(Duration::from_millis(10)))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_monitor_until_cancelled() {
        let (manager, _, _) = manager();
        let org = OrgId::new("org");
        let monitor = manager
            .monitor(&org, components(), vec!["k".into()], Some(Duration::from_secs(60)))
            .unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            let org = org.clone();
            tokio::spawn(async move { manager.run_monitor(&org, monitor.monitor_id, cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();

        let checks = task.await.unwrap().unwrap();
        assert_eq!(checks, 3);
    }

    #[tokio::test]
    async fn test_run_monitor_of_other_tenant_is_not_found() {
        let (manager, _, _) = manager();
        let owner = OrgId::new("owner");
        let monitor = manager
            .monitor(&owner, components(), vec!["k".into()], Some(Duration::from_secs(60)))
            .unwrap();

        let err = manager
            .run_monitor(&OrgId::new("intruder"), monitor.monitor_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::MonitorNotFound(id) if id == monitor.monitor_id));

        assert!(manager.run_due_monitors(&OrgId::new("intruder")).unwrap().is_empty());
        assert_eq!(manager.monitors(&owner)[0].checks, 0);
    }

    #[test]
    fn test_eventual_consistency_converges() {
        let (manager, source, _) = manager();
        let org = OrgId::new("org");
        let source_component = ComponentId::new("primary");
        let replica = ComponentId::new("replica");
        source.put(&org, &source_component, "k", json!("v2")).unwrap();
        source.put(&org, &replica, "k", json!("v1")).unwrap();

        let record = manager
            .track_eventual_consistency(&org, &source_component, &[replica.clone()], "k")
            .unwrap();
        assert!(!record.is_converged());

        source.put(&org, &replica, "k", json!("v2")).unwrap();
        let record = manager.refresh_convergence(&org, record.record_id).unwrap();
        assert!(record.is_converged());
        assert!(record.convergence_time().is_some());
    }

    #[test]
    fn test_source_wins_takes_first_component() {
        let (manager, _, _) = manager();
        let org = OrgId::new("org");
        let values = BTreeMap::from([
            (ComponentId::new("A"), json!("x")),
            (ComponentId::new("B"), json!("y")),
        ]);

        let conflict = manager.resolve_conflict(
            &org,
            &[ComponentId::new("A"), ComponentId::new("B")],
            "k",
            values,
            ConflictStrategy::SourceWins,
        );
        assert_eq!(conflict.resolved_value, Some(json!("x")));
    }

    #[test]
    fn test_latest_wins_and_ties() {
        let (manager, _, log) = manager();
        let org = OrgId::new("org");
        let order = [ComponentId::new("A"), ComponentId::new("B")];

        let values = BTreeMap::from([
            (ComponentId::new("A"), json!({ "v": 1, "updated_at": "2026-01-01T00:00:00Z" })),
            (ComponentId::new("B"), json!({ "v": 2, "updated_at": "2026-01-02T00:00:00Z" })),
        ]);
        let conflict = manager.resolve_conflict(&org, &order, "k", values, ConflictStrategy::LatestWins);
        assert_eq!(conflict.resolved_value.unwrap()["v"], json!(2));

        let tied = BTreeMap::from([
            (ComponentId::new("A"), json!({ "v": 1, "updated_at": 100 })),
            (ComponentId::new("B"), json!({ "v": 2, "updated_at": 100 })),
        ]);
        let conflict = manager.resolve_conflict(&org, &order, "k", tied, ConflictStrategy::LatestWins);
        assert!(!conflict.is_resolved());
        assert!(conflict.escalated);
        assert_eq!(log.escalations_of_kind(&org, EscalationKind::ConsistencyConflict).len(), 1);
    }

    #[test]
    fn test_merge_prefers_higher_version() {
        let (manager, _, _) = manager();
        let org = OrgId::new("org");
        let values = BTreeMap::from([
            (ComponentId::new("A"), json!({ "name": "old", "email": "a@x", "version": 1 })),
            (ComponentId::new("B"), json!({ "name": "new", "phone": "123", "version": 2 })),
        ]);

        let conflict = manager.resolve_conflict(
            &org,
            &[ComponentId::new("A"), ComponentId::new("B")],
            "user",
            values,
            ConflictStrategy::Merge,
        );
        let merged = conflict.resolved_value.unwrap();
        assert_eq!(merged["name"], json!("new"));
        assert_eq!(merged["email"], json!("a@x"));
        assert_eq!(merged["phone"], json!("123"));
        assert_eq!(merged["version"], json!(2));
    }

    #[test]
    fn test_manual_escalates() {
        let (manager, _, log) = manager();
        let org = OrgId::new("org");
        let conflict = manager.resolve_conflict(
            &org,
            &components(),
            "k",
            BTreeMap::from([(ComponentId::new("a"), json!(1))]),
            ConflictStrategy::Manual,
        );
        assert!(conflict.resolved_value.is_none());
        let escalation = &log.escalations_of_kind(&org, EscalationKind::ConsistencyConflict)[0];
        assert_eq!(escalation.severity, Severity::High);
        assert_eq!(manager.conflicts(&org).len(), 1);
    }
}
