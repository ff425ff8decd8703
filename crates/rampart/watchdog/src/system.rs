//! System-wide failure coordination.
//!
//! Orchestrates graceful shutdown, per-tenant state preservation and
//! recovery planning. Root causes are read from the cascade, deadlock and
//! race detectors through their public operations.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rampart_types::{ComponentId, Escalation, EscalationKind, EscalationLog, OrgId, RecordId, ResourceId, Severity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::cascade::CascadingFailureDetector;
use crate::config::RecoveryPlanConfig;
use crate::deadlock::{DeadlockCycle, DeadlockDetector};
use crate::race::RaceConditionMonitor;

/// Record of a graceful shutdown, process-wide or for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRecord {
    /// `None` for the process-wide shutdown.
    pub org_id: Option<OrgId>,
    pub reason: String,
    pub initiated_at: DateTime<Utc>,
}

/// State snapshot kept for recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedState {
    pub org_id: OrgId,
    pub state_type: String,
    pub data: Value,
    /// Array or object length, 1 for scalars.
    pub count: usize,
    pub preserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    AssessSystemState,
    RestoreCriticalServices,
    RestoreState,
    VerifyDataConsistency,
    ResumeOperations,
}

impl RecoveryAction {
    pub fn description(&self) -> &'static str {
        match self {
            RecoveryAction::AssessSystemState => "Assess system state and identify affected components",
            RecoveryAction::RestoreCriticalServices => "Restore critical system services and dependencies",
            RecoveryAction::RestoreState => "Restore preserved states",
            RecoveryAction::VerifyDataConsistency => "Verify data consistency across system",
            RecoveryAction::ResumeOperations => "Resume normal system operations",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// 1-based position in the plan.
    pub step: u32,
    pub action: RecoveryAction,
    pub description: String,
    pub estimated_duration_minutes: u32,
    /// Preserved state types, only set for [`RecoveryAction::RestoreState`].
    pub state_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub plan_id: RecordId,
    pub failure_reason: String,
    pub steps: Vec<RecoveryStep>,
    pub estimated_duration_minutes: u32,
    pub created_at: DateTime<Utc>,
}

/// What the detectors currently report for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseReport {
    pub org_id: OrgId,
    pub cascade_detected: bool,
    pub isolated_components: Vec<ComponentId>,
    pub deadlocks: Vec<DeadlockCycle>,
    pub raced_resources: Vec<ResourceId>,
    pub assessed_at: DateTime<Utc>,
}

impl RootCauseReport {
    pub fn has_root_cause(&self) -> bool {
        self.cascade_detected || !self.deadlocks.is_empty() || !self.raced_resources.is_empty()
    }

    fn to_details(&self) -> Value {
        json!({
            "cascade_detected": self.cascade_detected,
            "isolated_components": self.isolated_components.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "deadlocked_holders": self
                .deadlocks
                .iter()
                .map(|cycle| cycle.holders.iter().map(|h| h.as_str()).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "raced_resources": self.raced_resources.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        })
    }
}

/// Everything [`SystemFailureCoordinator::handle_system_failure`] did.
#[derive(Debug, Clone)]
pub struct SystemFailureOutcome {
    pub report: RootCauseReport,
    pub shutdown: ShutdownRecord,
    pub plan: RecoveryPlan,
    pub escalation: Escalation,
}

/// Coordinates responses to whole-system failures.
pub struct SystemFailureCoordinator {
    config: RecoveryPlanConfig,
    escalations: Arc<EscalationLog>,
    cascade: Arc<CascadingFailureDetector>,
    deadlock: Arc<DeadlockDetector>,
    race: Arc<RaceConditionMonitor>,
    shutdown: RwLock<Option<ShutdownRecord>>,
    tenant_shutdowns: RwLock<HashMap<OrgId, ShutdownRecord>>,
    preserved: RwLock<HashMap<OrgId, HashMap<String, PreservedState>>>,
    plans: RwLock<Vec<RecoveryPlan>>,
}

impl SystemFailureCoordinator {
    pub fn new(
        config: RecoveryPlanConfig,
        escalations: Arc<EscalationLog>,
        cascade: Arc<CascadingFailureDetector>,
        deadlock: Arc<DeadlockDetector>,
        race: Arc<RaceConditionMonitor>,
    ) -> Self {
        Self {
            config,
            escalations,
            cascade,
            deadlock,
            race,
            shutdown: RwLock::new(None),
            tenant_shutdowns: RwLock::new(HashMap::new()),
            preserved: RwLock::new(HashMap::new()),
            plans: RwLock::new(Vec::new()),
        }
    }

    /// Start a graceful shutdown. Later calls return the first record.
    pub fn initiate_graceful_shutdown(&self, reason: impl Into<String>) -> ShutdownRecord {
        let mut shutdown = self.shutdown.write();
        if let Some(existing) = shutdown.as_ref() {
            return existing.clone();
        }

        let record = ShutdownRecord {
            org_id: None,
            reason: reason.into(),
            initiated_at: Utc::now(),
        };
        warn!(reason = %record.reason, "Graceful shutdown initiated");
        *shutdown = Some(record.clone());
        record
    }

    /// Whether the process-wide shutdown has started.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown.read().is_some()
    }

    pub fn shutdown_info(&self) -> Option<ShutdownRecord> {
        self.shutdown.read().clone()
    }

    /// Shut down one tenant. Later calls for the same tenant return the
    /// first record; other tenants are untouched.
    pub fn initiate_tenant_shutdown(&self, org_id: &OrgId, reason: impl Into<String>) -> ShutdownRecord {
        let mut shutdowns = self.tenant_shutdowns.write();
        if let Some(existing) = shutdowns.get(org_id) {
            return existing.clone();
        }

        let record = ShutdownRecord {
            org_id: Some(org_id.clone()),
            reason: reason.into(),
            initiated_at: Utc::now(),
        };
        warn!(org_id = %org_id, reason = %record.reason, "Tenant shutdown initiated");
        shutdowns.insert(org_id.clone(), record.clone());
        record
    }

    /// Whether the tenant is shut down, by itself or by the process-wide shutdown.
    pub fn is_tenant_shut_down(&self, org_id: &OrgId) -> bool {
        self.is_shutdown_initiated() || self.tenant_shutdowns.read().contains_key(org_id)
    }

    pub fn tenant_shutdown_info(&self, org_id: &OrgId) -> Option<ShutdownRecord> {
        self.tenant_shutdowns.read().get(org_id).cloned()
    }

    /// Preserve state for `(org, state_type)`, replacing any earlier snapshot.
    pub fn preserve_state(&self, org_id: &OrgId, state_type: impl Into<String>, data: Value) -> PreservedState {
        let count = match &data {
            Value::Array(items) => items.len(),
            Value::Object(fields) => fields.len(),
            _ => 1,
        };
        let state = PreservedState {
            org_id: org_id.clone(),
            state_type: state_type.into(),
            data,
            count,
            preserved_at: Utc::now(),
        };

        info!(
            org_id = %org_id,
            state_type = %state.state_type,
            count = count,
            "State preserved"
        );

        self.preserved
            .write()
            .entry(org_id.clone())
            .or_default()
            .insert(state.state_type.clone(), state.clone());
        state
    }

    /// Most recently preserved payload, `None` if nothing was preserved.
    pub fn restore_state(&self, org_id: &OrgId, state_type: &str) -> Option<Value> {
        self.preserved
            .read()
            .get(org_id)
            .and_then(|tenant| tenant.get(state_type))
            .map(|state| state.data.clone())
    }

    /// A tenant's preserved states, sorted by type.
    pub fn preserved_states(&self, org_id: &OrgId) -> Vec<PreservedState> {
        let mut states: Vec<PreservedState> = self
            .preserved
            .read()
            .get(org_id)
            .map(|tenant| tenant.values().cloned().collect())
            .unwrap_or_default();
        states.sort_by(|a, b| a.state_type.cmp(&b.state_type));
        states
    }

    /// Build the fixed-order recovery plan. The state restore step is only
    /// included when something was preserved.
    pub fn generate_recovery_plan(&self, reason: impl Into<String>, preserved: &[PreservedState]) -> RecoveryPlan {
        let state_types: Vec<String> = preserved
            .iter()
            .map(|s| s.state_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut actions = vec![
            (RecoveryAction::AssessSystemState, self.config.assess_minutes),
            (RecoveryAction::RestoreCriticalServices, self.config.restore_services_minutes),
        ];
        if !state_types.is_empty() {
            actions.push((RecoveryAction::RestoreState, self.config.restore_state_minutes));
        }
        actions.push((RecoveryAction::VerifyDataConsistency, self.config.verify_consistency_minutes));
        actions.push((RecoveryAction::ResumeOperations, self.config.resume_minutes));

        let steps: Vec<RecoveryStep> = actions
            .into_iter()
            .zip(1u32..)
            .map(|((action, minutes), step)| {
                let (description, types) = if action == RecoveryAction::RestoreState {
                    (
                        format!("{}: {}", action.description(), state_types.join(", ")),
                        state_types.clone(),
                    )
                } else {
                    (action.description().to_string(), Vec::new())
                };
                RecoveryStep {
                    step,
                    action,
                    description,
                    estimated_duration_minutes: minutes,
                    state_types: types,
                }
            })
            .collect();

        let plan = RecoveryPlan {
            plan_id: RecordId::generate(),
            failure_reason: reason.into(),
            estimated_duration_minutes: steps.iter().map(|s| s.estimated_duration_minutes).sum(),
            steps,
            created_at: Utc::now(),
        };

        info!(
            plan_id = %plan.plan_id,
            steps = plan.steps.len(),
            minutes = plan.estimated_duration_minutes,
            "Recovery plan generated"
        );

        self.plans.write().push(plan.clone());
        plan
    }

    pub fn recovery_plans(&self) -> Vec<RecoveryPlan> {
        self.plans.read().clone()
    }

    /// Raise a `system_wide_failure` escalation. `details` fields are merged
    /// next to the reason.
    pub fn escalate_system_failure(&self, org_id: &OrgId, reason: &str, details: Value) -> Escalation {
        let mut merged = serde_json::Map::new();
        merged.insert("reason".into(), Value::String(reason.to_string()));
        if let Value::Object(extra) = details {
            merged.extend(extra);
        }

        self.escalations.raise(
            org_id,
            EscalationKind::SystemWideFailure,
            Severity::Critical,
            Value::Object(merged),
        )
    }

    /// Gather what the detectors currently report for a tenant.
    pub fn assess_root_causes(&self, org_id: &OrgId) -> RootCauseReport {
        RootCauseReport {
            org_id: org_id.clone(),
            cascade_detected: self.cascade.is_cascade_detected(org_id),
            isolated_components: self.cascade.isolated_components(org_id),
            deadlocks: self.deadlock.detect_cycles(org_id),
            raced_resources: self.race.raced_resources(org_id),
            assessed_at: Utc::now(),
        }
    }

    /// Assess, shut the tenant down, plan recovery from its preserved state
    /// and escalate.
    #[instrument(skip(self))]
    pub fn handle_system_failure(&self, org_id: &OrgId, reason: &str) -> SystemFailureOutcome {
        let report = self.assess_root_causes(org_id);
        let shutdown = self.initiate_tenant_shutdown(org_id, reason);
        let plan = self.generate_recovery_plan(reason, &self.preserved_states(org_id));

        let mut details = report.to_details();
        if let Value::Object(fields) = &mut details {
            fields.insert("recovery_plan_id".into(), Value::String(plan.plan_id.to_string()));
            fields.insert(
                "estimated_recovery_minutes".into(),
                Value::from(plan.estimated_duration_minutes),
            );
        }
        let escalation = self.escalate_system_failure(org_id, reason, details);

        SystemFailureOutcome {
            report,
            shutdown,
            plan,
            escalation,
        }
    }
}
