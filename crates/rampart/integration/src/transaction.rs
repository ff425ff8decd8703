//! Distributed transaction coordination.
//!
//! Transactions follow a fixed state machine:
//!
//! ```text
//! Initialized -> InProgress -> Committed
//!                InProgress -> RolledBack
//!                InProgress -> Failed -> Recovering -> InProgress | RolledBack
//! ```
//!
//! Every illegal transition is rejected with
//! [`IntegrationError::InvalidTransition`]; nothing is coerced.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rampart_types::{ComponentId, EscalationKind, EscalationLog, NodeId, OrgId, RecordId, Severity, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::{IntegrationError, Result};
use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Initialized,
    InProgress,
    Committed,
    RolledBack,
    Failed,
    Recovering,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionState::Initialized => "initialized",
            TransactionState::InProgress => "in_progress",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
            TransactionState::Recovering => "recovering",
        };
        write!(f, "{}", s)
    }
}

/// A transaction spanning several components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub org_id: OrgId,
    pub state: TransactionState,
    pub components: Vec<ComponentId>,
    pub operations: Vec<Value>,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStatus {
    Pending,
    Coordinating,
    Coordinated,
    Failed,
}

/// Coordination of one transaction across nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordination {
    pub coordination_id: RecordId,
    pub org_id: OrgId,
    pub transaction_id: TransactionId,
    pub nodes: BTreeMap<NodeId, CoordinationStatus>,
    pub status: CoordinationStatus,
    pub created_at: DateTime<Utc>,
    pub coordinated_at: Option<DateTime<Utc>>,
}

/// How a recovering transaction leaves recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Back to in-progress.
    Resumed,
    /// Rolled back.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecovery {
    pub recovery_id: RecordId,
    pub org_id: OrgId,
    pub transaction_id: TransactionId,
    pub failure_reason: String,
    pub actions: Vec<String>,
    pub outcome: Option<RecoveryOutcome>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A participant in two-phase commit.
pub trait CommitParticipant: Send + Sync {
    fn id(&self) -> NodeId;

    /// Vote on the transaction. `false` aborts it.
    fn prepare(&self, transaction: &Transaction) -> bool;

    fn commit(&self, transaction: &Transaction);

    fn abort(&self, transaction: &Transaction);
}

/// Result of [`TransactionCoordinator::two_phase_commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoPhaseOutcome {
    pub transaction: Transaction,
    pub committed: bool,
    pub prepared: Vec<NodeId>,
    /// Participants that voted no.
    pub rejected: Vec<NodeId>,
    pub aborted: Vec<NodeId>,
}

#[derive(Default)]
struct TenantTransactions {
    transactions: HashMap<TransactionId, Transaction>,
    coordinations: Vec<Coordination>,
    recoveries: Vec<TransactionRecovery>,
}

/// Tenant-scoped transaction coordinator.
pub struct TransactionCoordinator {
    tenants: RwLock<HashMap<OrgId, TenantTransactions>>,
    // Serializes two-phase commits so participants never see interleaved rounds.
    commit_round: Mutex<()>,
    bus: Arc<EventBus>,
    escalations: Arc<EscalationLog>,
}

impl TransactionCoordinator {
    pub fn new(bus: Arc<EventBus>, escalations: Arc<EscalationLog>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            commit_round: Mutex::new(()),
            bus,
            escalations,
        }
    }

    /// Create a transaction and move it to in-progress.
    #[instrument(skip(self, operations), fields(org_id = %org_id))]
    pub fn begin(&self, org_id: &OrgId, components: Vec<ComponentId>, operations: Vec<Value>) -> Transaction {
        let mut transaction = Transaction {
            id: TransactionId::generate(),
            org_id: org_id.clone(),
            state: TransactionState::Initialized,
            components,
            operations,
            created_at: Utc::now(),
            committed_at: None,
            rolled_back_at: None,
            failure_reason: None,
        };
        transaction.state = TransactionState::InProgress;

        self.tenants
            .write()
            .entry(org_id.clone())
            .or_default()
            .transactions
            .insert(transaction.id, transaction.clone());

        info!(org_id = %org_id, transaction = %transaction.id, components = transaction.components.len(), "Transaction started");
        transaction
    }

    pub fn commit(&self, org_id: &OrgId, id: TransactionId) -> Result<Transaction> {
        let transaction = self.mark_committed(org_id, id)?;
        self.publish(org_id, "transaction.committed", &transaction);
        Ok(transaction)
    }

    fn mark_committed(&self, org_id: &OrgId, id: TransactionId) -> Result<Transaction> {
        let transaction = self.transition(org_id, id, "commit", |txn| {
            if txn.state != TransactionState::InProgress {
                return false;
            }
            txn.state = TransactionState::Committed;
            txn.committed_at = Some(Utc::now());
            true
        })?;

        info!(org_id = %org_id, transaction = %id, "Transaction committed");
        Ok(transaction)
    }

    pub fn rollback(&self, org_id: &OrgId, id: TransactionId, reason: Option<&str>) -> Result<Transaction> {
        let transaction = self.transition(org_id, id, "roll back", |txn| {
            if txn.state != TransactionState::InProgress {
                return false;
            }
            txn.state = TransactionState::RolledBack;
            txn.rolled_back_at = Some(Utc::now());
            if let Some(reason) = reason {
                txn.failure_reason = Some(reason.to_string());
            }
            true
        })?;

        info!(org_id = %org_id, transaction = %id, reason = ?reason, "Transaction rolled back");
        self.publish(org_id, "transaction.rolled_back", &transaction);
        Ok(transaction)
    }

    /// Mark an in-progress transaction failed and escalate it.
    pub fn fail(&self, org_id: &OrgId, id: TransactionId, reason: &str) -> Result<Transaction> {
        let transaction = self.transition(org_id, id, "fail", |txn| {
            if txn.state != TransactionState::InProgress {
                return false;
            }
            txn.state = TransactionState::Failed;
            txn.failure_reason = Some(reason.to_string());
            true
        })?;

        self.escalations.raise(
            org_id,
            EscalationKind::TransactionFailure,
            Severity::High,
            json!({
                "transaction_id": id.to_string(),
                "reason": reason,
                "components": transaction.components,
            }),
        );
        self.publish(org_id, "transaction.failed", &transaction);
        Ok(transaction)
    }

    /// Start recovering a failed transaction.
    pub fn recover(&self, org_id: &OrgId, id: TransactionId, actions: Vec<String>) -> Result<TransactionRecovery> {
        let transaction = self.transition(org_id, id, "recover", |txn| {
            if txn.state != TransactionState::Failed {
                return false;
            }
            txn.state = TransactionState::Recovering;
            true
        })?;

        let recovery = TransactionRecovery {
            recovery_id: RecordId::generate(),
            org_id: org_id.clone(),
            transaction_id: id,
            failure_reason: transaction.failure_reason.clone().unwrap_or_default(),
            actions,
            outcome: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        self.tenants
            .write()
            .entry(org_id.clone())
            .or_default()
            .recoveries
            .push(recovery.clone());

        info!(org_id = %org_id, transaction = %id, actions = recovery.actions.len(), "Transaction recovering");
        Ok(recovery)
    }

    /// Finish recovery, either resuming or abandoning the transaction.
    pub fn complete_recovery(&self, org_id: &OrgId, id: TransactionId, outcome: RecoveryOutcome) -> Result<Transaction> {
        let transaction = self.transition(org_id, id, "complete recovery of", |txn| {
            if txn.state != TransactionState::Recovering {
                return false;
            }
            match outcome {
                RecoveryOutcome::Resumed => txn.state = TransactionState::InProgress,
                RecoveryOutcome::Abandoned => {
                    txn.state = TransactionState::RolledBack;
                    txn.rolled_back_at = Some(Utc::now());
                }
            }
            true
        })?;

        if let Some(tenant) = self.tenants.write().get_mut(org_id) {
            if let Some(recovery) = tenant
                .recoveries
                .iter_mut()
                .rev()
                .find(|r| r.transaction_id == id && r.outcome.is_none())
            {
                recovery.outcome = Some(outcome);
                recovery.completed_at = Some(Utc::now());
            }
        }

        info!(org_id = %org_id, transaction = %id, outcome = ?outcome, "Transaction recovery complete");
        if outcome == RecoveryOutcome::Abandoned {
            self.publish(org_id, "transaction.rolled_back", &transaction);
        }
        Ok(transaction)
    }

    /// Mark every node coordinated for an in-progress transaction.
    pub fn coordinate_distributed(&self, org_id: &OrgId, id: TransactionId, nodes: Vec<NodeId>) -> Result<Coordination> {
        if nodes.is_empty() {
            return Err(IntegrationError::InvalidArgument("coordination needs at least one node".into()));
        }

        let mut tenants = self.tenants.write();
        let tenant = tenants
            .get_mut(org_id)
            .ok_or(IntegrationError::TransactionNotFound(id))?;
        let transaction = tenant
            .transactions
            .get(&id)
            .ok_or(IntegrationError::TransactionNotFound(id))?;
        if transaction.state != TransactionState::InProgress {
            return Err(IntegrationError::InvalidTransition {
                id,
                from: transaction.state,
                action: "coordinate",
            });
        }

        let mut coordination = Coordination {
            coordination_id: RecordId::generate(),
            org_id: org_id.clone(),
            transaction_id: id,
            nodes: nodes
                .into_iter()
                .map(|node| (node, CoordinationStatus::Pending))
                .collect(),
            status: CoordinationStatus::Coordinating,
            created_at: Utc::now(),
            coordinated_at: None,
        };
        // Under the tenant write lock, so readers see all nodes flip at once.
        for status in coordination.nodes.values_mut() {
            *status = CoordinationStatus::Coordinated;
        }
        coordination.status = CoordinationStatus::Coordinated;
        coordination.coordinated_at = Some(Utc::now());
        tenant.coordinations.push(coordination.clone());

        info!(org_id = %org_id, transaction = %id, nodes = coordination.nodes.len(), "Transaction coordinated");
        Ok(coordination)
    }

    /// Prepare every participant; commit everywhere only if all vote yes.
    /// Otherwise abort the prepared participants and fail the transaction.
    ///
    /// The transaction is marked committed before any participant commit
    /// hook runs, so a concurrent rollback can no longer land. If it was
    /// moved out of in-progress while votes were collected, the prepared
    /// participants are aborted and the transition error is returned.
    #[instrument(skip(self, participants), fields(org_id = %org_id, transaction = %id))]
    pub fn two_phase_commit(
        &self,
        org_id: &OrgId,
        id: TransactionId,
        participants: &[Arc<dyn CommitParticipant>],
    ) -> Result<TwoPhaseOutcome> {
        let _round = self.commit_round.lock();

        let transaction = self.get(org_id, id)?;
        if transaction.state != TransactionState::InProgress {
            return Err(IntegrationError::InvalidTransition {
                id,
                from: transaction.state,
                action: "commit",
            });
        }

        let mut prepared = Vec::new();
        let mut rejected = Vec::new();
        for participant in participants {
            if participant.prepare(&transaction) {
                prepared.push(participant.id());
            } else {
                rejected.push(participant.id());
                // No point asking the rest.
                break;
            }
        }

        if rejected.is_empty() {
            let transaction = match self.mark_committed(org_id, id) {
                Ok(transaction) => transaction,
                Err(e) => {
                    for participant in participants {
                        participant.abort(&transaction);
                    }
                    warn!(org_id = %org_id, transaction = %id, error = %e, "Transaction left in-progress during prepare");
                    return Err(e);
                }
            };
            for participant in participants {
                participant.commit(&transaction);
            }
            self.publish(org_id, "transaction.committed", &transaction);
            return Ok(TwoPhaseOutcome {
                transaction,
                committed: true,
                prepared,
                rejected,
                aborted: Vec::new(),
            });
        }

        let mut aborted = Vec::new();
        for participant in participants {
            let participant_id = participant.id();
            if prepared.contains(&participant_id) {
                participant.abort(&transaction);
                aborted.push(participant_id);
            }
        }

        warn!(
            org_id = %org_id,
            transaction = %id,
            rejected = ?rejected,
            aborted = aborted.len(),
            "Two-phase commit aborted"
        );

        let reason = format!(
            "prepare rejected by {}",
            rejected.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
        );
        let transaction = self.fail(org_id, id, &reason)?;

        Ok(TwoPhaseOutcome {
            transaction,
            committed: false,
            prepared,
            rejected,
            aborted,
        })
    }

    /// A tenant's transaction. Other tenants' transactions read as not found.
    pub fn get(&self, org_id: &OrgId, id: TransactionId) -> Result<Transaction> {
        self.tenants
            .read()
            .get(org_id)
            .and_then(|tenant| tenant.transactions.get(&id))
            .cloned()
            .ok_or(IntegrationError::TransactionNotFound(id))
    }

    /// All transactions of a tenant, oldest first.
    pub fn transactions(&self, org_id: &OrgId) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self
            .tenants
            .read()
            .get(org_id)
            .map(|tenant| tenant.transactions.values().cloned().collect())
            .unwrap_or_default();
        transactions.sort_by_key(|t| t.created_at);
        transactions
    }

    pub fn coordinations(&self, org_id: &OrgId, id: TransactionId) -> Vec<Coordination> {
        self.tenants
            .read()
            .get(org_id)
            .map(|tenant| {
                tenant
                    .coordinations
                    .iter()
                    .filter(|c| c.transaction_id == id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn recoveries(&self, org_id: &OrgId, id: TransactionId) -> Vec<TransactionRecovery> {
        self.tenants
            .read()
            .get(org_id)
            .map(|tenant| {
                tenant
                    .recoveries
                    .iter()
                    .filter(|r| r.transaction_id == id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply `apply` under the table lock. `apply` returns false when the
    /// current state does not allow the action.
    fn transition<F>(&self, org_id: &OrgId, id: TransactionId, action: &'static str, apply: F) -> Result<Transaction>
    where
        F: FnOnce(&mut Transaction) -> bool,
    {
        let mut tenants = self.tenants.write();
        let transaction = tenants
            .get_mut(org_id)
            .and_then(|tenant| tenant.transactions.get_mut(&id))
            .ok_or(IntegrationError::TransactionNotFound(id))?;

        let from = transaction.state;
        if !apply(transaction) {
            warn!(org_id = %org_id, transaction = %id, state = %from, action = action, "Rejected transaction transition");
            return Err(IntegrationError::InvalidTransition { id, from, action });
        }
        Ok(transaction.clone())
    }

    // Published after the table lock is released so subscribers can call back in.
    fn publish(&self, org_id: &OrgId, event_type: &str, transaction: &Transaction) {
        self.bus.publish(
            org_id,
            event_type,
            json!({
                "transaction_id": transaction.id.to_string(),
                "state": transaction.state,
                "components": transaction.components,
                "reason": transaction.failure_reason,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> (TransactionCoordinator, Arc<EventBus>, Arc<EscalationLog>) {
        let log = Arc::new(EscalationLog::new());
        let bus = Arc::new(EventBus::new(log.clone()));
        (TransactionCoordinator::new(bus.clone(), log.clone()), bus, log)
    }

    fn begin(coordinator: &TransactionCoordinator, org: &OrgId) -> Transaction {
        coordinator.begin(
            org,
            vec![ComponentId::new("orders"), ComponentId::new("billing")],
            vec![json!({ "op": "debit" })],
        )
    }

    struct Voter {
        id: NodeId,
        vote: bool,
        commits: AtomicUsize,
        aborts: AtomicUsize,
    }

    impl Voter {
        fn new(id: &str, vote: bool) -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::new(id),
                vote,
                commits: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
            })
        }
    }

    impl CommitParticipant for Voter {
        fn id(&self) -> NodeId {
            self.id.clone()
        }

        fn prepare(&self, _transaction: &Transaction) -> bool {
            self.vote
        }

        fn commit(&self, _transaction: &Transaction) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&self, _transaction: &Transaction) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Rolls the transaction back from inside a participant hook.
    struct Saboteur {
        coordinator: Arc<TransactionCoordinator>,
        org: OrgId,
        during_prepare: bool,
        rollback_result: Mutex<Option<bool>>,
        commits: AtomicUsize,
        aborts: AtomicUsize,
    }

    impl Saboteur {
        fn new(coordinator: Arc<TransactionCoordinator>, org: &OrgId, during_prepare: bool) -> Arc<Self> {
            Arc::new(Self {
                coordinator,
                org: org.clone(),
                during_prepare,
                rollback_result: Mutex::new(None),
                commits: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
            })
        }

        fn roll_back(&self, transaction: &Transaction) {
            let result = self.coordinator.rollback(&self.org, transaction.id, Some("interleaved"));
            *self.rollback_result.lock() = Some(result.is_ok());
        }
    }

    impl CommitParticipant for Saboteur {
        fn id(&self) -> NodeId {
            NodeId::new("saboteur")
        }

        fn prepare(&self, transaction: &Transaction) -> bool {
            if self.during_prepare {
                self.roll_back(transaction);
            }
            true
        }

        fn commit(&self, transaction: &Transaction) {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if !self.during_prepare {
                self.roll_back(transaction);
            }
        }

        fn abort(&self, _transaction: &Transaction) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_rollback_cannot_land_during_commit_phase() {
        let log = Arc::new(EscalationLog::new());
        let coordinator = Arc::new(TransactionCoordinator::new(Arc::new(EventBus::new(log.clone())), log));
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);

        let saboteur = Saboteur::new(coordinator.clone(), &org, false);
        let participants: Vec<Arc<dyn CommitParticipant>> = vec![saboteur.clone()];

        let outcome = coordinator.two_phase_commit(&org, txn.id, &participants).unwrap();
        assert!(outcome.committed);
        assert_eq!(saboteur.commits.load(Ordering::SeqCst), 1);
        assert_eq!(*saboteur.rollback_result.lock(), Some(false));
        assert_eq!(coordinator.get(&org, txn.id).unwrap().state, TransactionState::Committed);
    }

    #[test]
    fn test_rollback_during_prepare_aborts_participants() {
        let log = Arc::new(EscalationLog::new());
        let coordinator = Arc::new(TransactionCoordinator::new(Arc::new(EventBus::new(log.clone())), log));
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);

        let saboteur = Saboteur::new(coordinator.clone(), &org, true);
        let voter = Voter::new("billing", true);
        let participants: Vec<Arc<dyn CommitParticipant>> = vec![saboteur.clone(), voter.clone()];

        let err = coordinator.two_phase_commit(&org, txn.id, &participants).unwrap_err();
        assert!(matches!(
            err,
            IntegrationError::InvalidTransition {
                from: TransactionState::RolledBack,
                ..
            }
        ));
        assert_eq!(*saboteur.rollback_result.lock(), Some(true));
        assert_eq!(saboteur.commits.load(Ordering::SeqCst), 0);
        assert_eq!(voter.commits.load(Ordering::SeqCst), 0);
        assert_eq!(saboteur.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(voter.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.get(&org, txn.id).unwrap().state, TransactionState::RolledBack);
    }

    #[test]
    fn test_begin_is_in_progress() {
        let (coordinator, _, _) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);
        assert_eq!(txn.state, TransactionState::InProgress);
        assert_eq!(coordinator.transactions(&org).len(), 1);
    }

    #[test]
    fn test_commit_then_commit_again_fails() {
        let (coordinator, bus, _) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);

        let committed = coordinator.commit(&org, txn.id).unwrap();
        assert_eq!(committed.state, TransactionState::Committed);
        assert!(committed.committed_at.is_some());

        let err = coordinator.commit(&org, txn.id).unwrap_err();
        assert!(matches!(
            err,
            IntegrationError::InvalidTransition {
                from: TransactionState::Committed,
                ..
            }
        ));
        assert!(err.is_validation());

        let err = coordinator.rollback(&org, txn.id, None).unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidTransition { .. }));

        assert_eq!(bus.published_events(&org, Some("transaction.committed")).len(), 1);
    }

    #[test]
    fn test_rollback_records_reason() {
        let (coordinator, _, _) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);

        let rolled_back = coordinator.rollback(&org, txn.id, Some("user cancelled")).unwrap();
        assert_eq!(rolled_back.state, TransactionState::RolledBack);
        assert_eq!(rolled_back.failure_reason.as_deref(), Some("user cancelled"));
        assert!(coordinator.commit(&org, txn.id).is_err());
    }

    #[test]
    fn test_other_tenant_cannot_see_transaction() {
        let (coordinator, _, _) = coordinator();
        let org = OrgId::new("org-a");
        let txn = begin(&coordinator, &org);

        let err = coordinator.commit(&OrgId::new("org-b"), txn.id).unwrap_err();
        assert!(matches!(err, IntegrationError::TransactionNotFound(_)));
        assert_eq!(coordinator.get(&org, txn.id).unwrap().state, TransactionState::InProgress);
    }

    #[test]
    fn test_fail_recover_resume() {
        let (coordinator, _, log) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);

        // Recovery needs a failed transaction.
        assert!(coordinator.recover(&org, txn.id, vec![]).is_err());

        coordinator.fail(&org, txn.id, "billing timeout").unwrap();
        assert_eq!(log.escalations_of_kind(&org, EscalationKind::TransactionFailure).len(), 1);

        let recovery = coordinator
            .recover(&org, txn.id, vec!["replay debit".into()])
            .unwrap();
        assert_eq!(recovery.failure_reason, "billing timeout");
        assert_eq!(coordinator.get(&org, txn.id).unwrap().state, TransactionState::Recovering);

        // Recovering is not committable.
        assert!(coordinator.commit(&org, txn.id).is_err());

        let resumed = coordinator
            .complete_recovery(&org, txn.id, RecoveryOutcome::Resumed)
            .unwrap();
        assert_eq!(resumed.state, TransactionState::InProgress);
        assert!(coordinator.commit(&org, txn.id).is_ok());

        let recoveries = coordinator.recoveries(&org, txn.id);
        assert_eq!(recoveries[0].outcome, Some(RecoveryOutcome::Resumed));
    }

    #[test]
    fn test_abandoned_recovery_rolls_back() {
        let (coordinator, _, _) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);
        coordinator.fail(&org, txn.id, "boom").unwrap();
        coordinator.recover(&org, txn.id, vec![]).unwrap();

        let abandoned = coordinator
            .complete_recovery(&org, txn.id, RecoveryOutcome::Abandoned)
            .unwrap();
        assert_eq!(abandoned.state, TransactionState::RolledBack);
        assert!(abandoned.state.is_terminal());
    }

    #[test]
    fn test_coordinate_distributed_marks_all_nodes() {
        let (coordinator, _, _) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);

        let coordination = coordinator
            .coordinate_distributed(&org, txn.id, vec![NodeId::new("n1"), NodeId::new("n2")])
            .unwrap();
        assert_eq!(coordination.status, CoordinationStatus::Coordinated);
        assert!(coordination
            .nodes
            .values()
            .all(|s| *s == CoordinationStatus::Coordinated));

        coordinator.commit(&org, txn.id).unwrap();
        assert!(coordinator
            .coordinate_distributed(&org, txn.id, vec![NodeId::new("n1")])
            .is_err());
    }

    #[test]
    fn test_two_phase_commit_all_yes() {
        let (coordinator, _, _) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);
        let a = Voter::new("a", true);
        let b = Voter::new("b", true);
        let participants: Vec<Arc<dyn CommitParticipant>> = vec![a.clone(), b.clone()];

        let outcome = coordinator.two_phase_commit(&org, txn.id, &participants).unwrap();
        assert!(outcome.committed);
        assert_eq!(outcome.transaction.state, TransactionState::Committed);
        assert_eq!(a.commits.load(Ordering::SeqCst), 1);
        assert_eq!(b.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_phase_commit_partial_failure_aborts_prepared() {
        let (coordinator, _, log) = coordinator();
        let org = OrgId::new("org");
        let txn = begin(&coordinator, &org);
        let a = Voter::new("a", true);
        let b = Voter::new("b", false);
        let c = Voter::new("c", true);
        let participants: Vec<Arc<dyn CommitParticipant>> = vec![a.clone(), b.clone(), c.clone()];

        let outcome = coordinator.two_phase_commit(&org, txn.id, &participants).unwrap();
        assert!(!outcome.committed);
        assert_eq!(outcome.rejected, vec![NodeId::new("b")]);
        assert_eq!(outcome.aborted, vec![NodeId::new("a")]);
        assert_eq!(outcome.transaction.state, TransactionState::Failed);

        assert_eq!(a.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(b.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(c.commits.load(Ordering::SeqCst), 0);
        assert_eq!(log.escalations_of_kind(&org, EscalationKind::TransactionFailure).len(), 1);
    }
}
