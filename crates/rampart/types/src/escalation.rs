//! Escalations: the outbound signal raised when a failure cannot be
//! contained locally.
//!
//! Every detector and coordinator shares one [`EscalationLog`]. Consumers
//! either poll per tenant or subscribe to the broadcast stream. External
//! persistence is delegated to [`EscalationSink`] implementations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ids::{EscalationId, OrgId};

/// Default capacity of the escalation broadcast channel.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Escalation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What kind of uncontained failure an escalation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    CascadingFailure,
    DeadlockUnrecoverable,
    RaceConditionPersistent,
    SystemWideFailure,
    ConsistencyConflict,
    EventDeliveryFailure,
    TransactionFailure,
    ServiceRetriesExhausted,
    CrossComponentError,
}

impl EscalationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationKind::CascadingFailure => "cascading_failure",
            EscalationKind::DeadlockUnrecoverable => "deadlock_unrecoverable",
            EscalationKind::RaceConditionPersistent => "race_condition_persistent",
            EscalationKind::SystemWideFailure => "system_wide_failure",
            EscalationKind::ConsistencyConflict => "consistency_conflict",
            EscalationKind::EventDeliveryFailure => "event_delivery_failure",
            EscalationKind::TransactionFailure => "transaction_failure",
            EscalationKind::ServiceRetriesExhausted => "service_retries_exhausted",
            EscalationKind::CrossComponentError => "cross_component_error",
        }
    }
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single escalation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: EscalationId,
    pub kind: EscalationKind,
    pub severity: Severity,
    pub org_id: OrgId,
    pub timestamp: DateTime<Utc>,
    /// Kind-specific details, always a JSON object.
    pub details: serde_json::Value,
}

impl Escalation {
    /// Look up a string field in the details object.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(|v| v.as_str())
    }
}

/// Destination for escalations outside the process (pager, ticketing, audit
/// store). Sinks must not block.
pub trait EscalationSink: Send + Sync {
    fn write(&self, escalation: &Escalation);
}

/// Sink that keeps every escalation in memory.
#[derive(Default)]
pub struct MemoryEscalationSink {
    entries: RwLock<Vec<Escalation>>,
}

impl MemoryEscalationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Escalation> {
        self.entries.read().clone()
    }
}

impl EscalationSink for MemoryEscalationSink {
    fn write(&self, escalation: &Escalation) {
        self.entries.write().push(escalation.clone());
    }
}

/// Tenant-scoped, append-only escalation trail.
pub struct EscalationLog {
    entries: RwLock<HashMap<OrgId, Vec<Escalation>>>,
    sender: broadcast::Sender<Escalation>,
    sinks: RwLock<Vec<Arc<dyn EscalationSink>>>,
}

impl EscalationLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STREAM_CAPACITY)
    }

    /// Create a log whose broadcast stream buffers `capacity` escalations.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: RwLock::new(HashMap::new()),
            sender,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Attach an external sink. Only escalations raised afterwards reach it.
    pub fn add_sink(&self, sink: Arc<dyn EscalationSink>) {
        self.sinks.write().push(sink);
    }

    /// Record an escalation for `org_id` and fan it out to subscribers and sinks.
    pub fn raise(
        &self,
        org_id: &OrgId,
        kind: EscalationKind,
        severity: Severity,
        details: serde_json::Value,
    ) -> Escalation {
        let details = match details {
            serde_json::Value::Object(_) => details,
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };

        let escalation = Escalation {
            id: EscalationId::generate(),
            kind,
            severity,
            org_id: org_id.clone(),
            timestamp: Utc::now(),
            details,
        };

        warn!(
            org_id = %org_id,
            escalation_id = %escalation.id,
            kind = %kind,
            severity = %severity,
            "Escalation raised"
        );

        self.entries
            .write()
            .entry(org_id.clone())
            .or_default()
            .push(escalation.clone());

        for sink in self.sinks.read().iter() {
            sink.write(&escalation);
        }

        // No receivers is not an error; the poll interface still has it.
        if self.sender.send(escalation.clone()).is_err() {
            debug!(escalation_id = %escalation.id, "No escalation subscribers");
        }

        escalation
    }

    /// All escalations raised for a tenant, oldest first.
    pub fn escalations(&self, org_id: &OrgId) -> Vec<Escalation> {
        self.entries
            .read()
            .get(org_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Escalations of one kind for a tenant.
    pub fn escalations_of_kind(&self, org_id: &OrgId, kind: EscalationKind) -> Vec<Escalation> {
        self.entries
            .read()
            .get(org_id)
            .map(|list| list.iter().filter(|e| e.kind == kind).cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, org_id: &OrgId) -> usize {
        self.entries.read().get(org_id).map_or(0, Vec::len)
    }

    /// Operator-wide stream of every escalation raised from now on, across
    /// all tenants. Tenant-facing consumers use [`Self::subscribe_org`].
    pub fn subscribe(&self) -> broadcast::Receiver<Escalation> {
        self.sender.subscribe()
    }

    /// Stream of escalations raised for `org_id` only.
    pub fn subscribe_org(&self, org_id: &OrgId) -> TenantEscalations {
        TenantEscalations {
            org_id: org_id.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver that only yields escalations of one tenant.
///
/// Shares the broadcast buffer with every other subscriber, so a lagging
/// consumer still sees [`broadcast::error::RecvError::Lagged`].
pub struct TenantEscalations {
    org_id: OrgId,
    receiver: broadcast::Receiver<Escalation>,
}

impl TenantEscalations {
    pub fn org_id(&self) -> &OrgId {
        &self.org_id
    }

    /// Wait for the next escalation of this tenant.
    pub async fn recv(&mut self) -> Result<Escalation, broadcast::error::RecvError> {
        loop {
            let escalation = self.receiver.recv().await?;
            if escalation.org_id == self.org_id {
                return Ok(escalation);
            }
        }
    }

    /// Next buffered escalation of this tenant, without waiting.
    pub fn try_recv(&mut self) -> Result<Escalation, broadcast::error::TryRecvError> {
        loop {
            let escalation = self.receiver.try_recv()?;
            if escalation.org_id == self.org_id {
                return Ok(escalation);
            }
        }
    }
}

impl Default for EscalationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raise_is_tenant_scoped() {
        let log = EscalationLog::new();
        let a = OrgId::new("org-a");
        let b = OrgId::new("org-b");

        log.raise(&a, EscalationKind::CascadingFailure, Severity::Critical, json!({}));

        assert_eq!(log.count(&a), 1);
        assert!(log.escalations(&b).is_empty());
    }

    #[test]
    fn test_details_normalized_to_object() {
        let log = EscalationLog::new();
        let org = OrgId::new("org");

        let e = log.raise(&org, EscalationKind::SystemWideFailure, Severity::Critical, json!(null));
        assert!(e.details.is_object());

        let e = log.raise(&org, EscalationKind::SystemWideFailure, Severity::Critical, json!("boom"));
        assert_eq!(e.details["value"], "boom");
    }

    #[test]
    fn test_filter_by_kind() {
        let log = EscalationLog::new();
        let org = OrgId::new("org");
        log.raise(&org, EscalationKind::TransactionFailure, Severity::High, json!({}));
        log.raise(&org, EscalationKind::CascadingFailure, Severity::Critical, json!({}));

        let found = log.escalations_of_kind(&org, EscalationKind::TransactionFailure);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::High);
    }

    #[test]
    fn test_sink_receives_escalations() {
        let log = EscalationLog::new();
        let sink = Arc::new(MemoryEscalationSink::new());
        log.add_sink(sink.clone());

        log.raise(
            &OrgId::new("org"),
            EscalationKind::DeadlockUnrecoverable,
            Severity::Critical,
            json!({"resources": ["r1"]}),
        );

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind.to_string(), "deadlock_unrecoverable");
    }

    #[tokio::test]
    async fn test_subscribe_stream() {
        let log = EscalationLog::new();
        let mut rx = log.subscribe();

        log.raise(
            &OrgId::new("org"),
            EscalationKind::ConsistencyConflict,
            Severity::High,
            json!({"key": "k"}),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EscalationKind::ConsistencyConflict);
        assert_eq!(received.detail_str("key"), Some("k"));
    }

    #[tokio::test]
    async fn test_subscribe_org_skips_other_tenants() {
        let log = EscalationLog::new();
        let (a, b) = (OrgId::new("org-a"), OrgId::new("org-b"));
        let mut only_a = log.subscribe_org(&a);

        log.raise(&b, EscalationKind::CascadingFailure, Severity::Critical, json!({"who": "b"}));
        log.raise(&a, EscalationKind::TransactionFailure, Severity::High, json!({"who": "a"}));
        log.raise(&b, EscalationKind::SystemWideFailure, Severity::Critical, json!({}));

        let received = only_a.recv().await.unwrap();
        assert_eq!(received.org_id, a);
        assert_eq!(received.detail_str("who"), Some("a"));
        assert!(matches!(
            only_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
