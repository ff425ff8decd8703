//! Race condition detection with backoff retry.
//!
//! Access attempts are recorded per tenant and resource. Two writes closer
//! together than the race window are a race. Contended callers back off
//! exponentially and escalate once the policy is exhausted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rampart_types::{
    retry_with_backoff, AccessorId, BackoffPolicy, Escalation, EscalationKind, EscalationLog, OrgId,
    ResourceId, RetryDecision, RetryError, Severity,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::RaceConfig;
use crate::error::{Result, WatchdogError};

/// Kind of access made to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOperation {
    Read,
    Write,
}

impl std::fmt::Display for AccessOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessOperation::Read => write!(f, "read"),
            AccessOperation::Write => write!(f, "write"),
        }
    }
}

/// A recorded access attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessAttempt {
    pub resource_id: ResourceId,
    pub accessor_id: AccessorId,
    pub operation: AccessOperation,
    pub timestamp: DateTime<Utc>,
    pub org_id: OrgId,
}

type AttemptKey = (OrgId, ResourceId);
type RetryKey = (OrgId, ResourceId, AccessorId);

/// Detects concurrent writes and drives backoff retries.
pub struct RaceConditionMonitor {
    config: RaceConfig,
    escalations: Arc<EscalationLog>,
    attempts: RwLock<HashMap<AttemptKey, VecDeque<AccessAttempt>>>,
    retry_counts: Mutex<HashMap<RetryKey, u32>>,
    /// Wall time paired with the monotonic instant it was read at.
    clock_origin: (DateTime<Utc>, Instant),
}

impl RaceConditionMonitor {
    pub fn new(config: RaceConfig, escalations: Arc<EscalationLog>) -> Self {
        Self {
            config,
            escalations,
            attempts: RwLock::new(HashMap::new()),
            retry_counts: Mutex::new(HashMap::new()),
            clock_origin: (Utc::now(), Instant::now()),
        }
    }

    /// Timestamp for attempts made now.
    ///
    /// Advances with the tokio clock that also drives retry backoff, so
    /// race windows and backoff delays are measured on one clock.
    pub fn now(&self) -> DateTime<Utc> {
        let (wall, origin) = self.clock_origin;
        chrono::Duration::from_std(origin.elapsed())
            .ok()
            .and_then(|elapsed| wall.checked_add_signed(elapsed))
            .unwrap_or(wall)
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.config.backoff
    }

    /// Record an access attempt made now.
    pub fn attempt_access(
        &self,
        org_id: &OrgId,
        resource: &ResourceId,
        accessor: &AccessorId,
        operation: AccessOperation,
    ) -> AccessAttempt {
        self.attempt_access_at(org_id, resource, accessor, operation, self.now())
    }

    /// Record an access attempt with an explicit timestamp.
    pub fn attempt_access_at(
        &self,
        org_id: &OrgId,
        resource: &ResourceId,
        accessor: &AccessorId,
        operation: AccessOperation,
        timestamp: DateTime<Utc>,
    ) -> AccessAttempt {
        let attempt = AccessAttempt {
            resource_id: resource.clone(),
            accessor_id: accessor.clone(),
            operation,
            timestamp,
            org_id: org_id.clone(),
        };

        let mut attempts = self.attempts.write();
        let history = attempts.entry((org_id.clone(), resource.clone())).or_default();
        history.push_back(attempt.clone());
        while history.len() > self.config.history_per_resource.max(2) {
            history.pop_front();
        }

        debug!(
            org_id = %org_id,
            resource = %resource,
            accessor = %accessor,
            operation = %operation,
            "Access attempt recorded"
        );
        attempt
    }

    /// Whether any two consecutive writes on `resource` are strictly less
    /// than `window` apart.
    pub fn is_race_detected(&self, org_id: &OrgId, resource: &ResourceId, window: Duration) -> bool {
        let attempts = self.attempts.read();
        let Some(history) = attempts.get(&(org_id.clone(), resource.clone())) else {
            return false;
        };

        let mut writes: Vec<DateTime<Utc>> = history
            .iter()
            .filter(|a| a.operation == AccessOperation::Write)
            .map(|a| a.timestamp)
            .collect();
        if writes.len() < 2 {
            return false;
        }
        writes.sort();

        let window = window_millis(window);
        writes
            .windows(2)
            .any(|pair| (pair[1] - pair[0]).num_milliseconds() < window)
    }

    /// Race check using the configured window.
    pub fn is_race_detected_default(&self, org_id: &OrgId, resource: &ResourceId) -> bool {
        self.is_race_detected(org_id, resource, self.config.window())
    }

    /// Decide whether `accessor` should retry after failed attempt number
    /// `attempt`, recording the retry.
    pub fn retry(
        &self,
        org_id: &OrgId,
        resource: &ResourceId,
        accessor: &AccessorId,
        operation: AccessOperation,
        attempt: u32,
    ) -> RetryDecision {
        let decision = self.config.backoff.decide(attempt);
        if decision.should_retry {
            self.retry_counts
                .lock()
                .insert((org_id.clone(), resource.clone(), accessor.clone()), attempt);
            debug!(
                org_id = %org_id,
                resource = %resource,
                accessor = %accessor,
                operation = %operation,
                attempt = attempt,
                backoff_ms = decision.backoff.as_millis() as u64,
                "Retry scheduled"
            );
        }
        decision
    }

    pub fn retry_count(&self, org_id: &OrgId, resource: &ResourceId, accessor: &AccessorId) -> u32 {
        self.retry_counts
            .lock()
            .get(&(org_id.clone(), resource.clone(), accessor.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Raise a `race_condition_persistent` escalation.
    pub fn escalate_persistent(
        &self,
        org_id: &OrgId,
        resource: &ResourceId,
        accessor: &AccessorId,
        severity: Severity,
    ) -> Escalation {
        self.escalations.raise(
            org_id,
            EscalationKind::RaceConditionPersistent,
            severity,
            json!({
                "resource_id": resource.as_str(),
                "accessor_id": accessor.as_str(),
                "retry_count": self.retry_count(org_id, resource, accessor),
            }),
        )
    }

    /// Run `f` once no other accessor is writing `resource` within the race
    /// window, backing off between attempts.
    ///
    /// Exhausting the policy raises a `high` severity escalation.
    #[instrument(skip(self, cancel, f))]
    pub async fn guarded_access<T, F>(
        &self,
        org_id: &OrgId,
        resource: &ResourceId,
        accessor: &AccessorId,
        operation: AccessOperation,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let outcome = retry_with_backoff(&self.config.backoff, cancel, |attempt| {
            if attempt > 1 {
                self.retry(org_id, resource, accessor, operation, attempt - 1);
            }
            let recorded = self.attempt_access(org_id, resource, accessor, operation);
            let contended = self.conflicts_with_others(&recorded);
            async move {
                if contended {
                    Err(attempt)
                } else {
                    Ok(())
                }
            }
        })
        .await;

        match outcome {
            Ok(()) => Ok(f()),
            Err(RetryError::Cancelled { .. }) => Err(WatchdogError::Cancelled),
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(
                    org_id = %org_id,
                    resource = %resource,
                    accessor = %accessor,
                    attempts = attempts,
                    "Race persisted through all retries"
                );
                self.escalate_persistent(org_id, resource, accessor, Severity::High);
                Err(WatchdogError::RacePersistent {
                    resource: resource.clone(),
                    attempts,
                })
            }
        }
    }

    /// Resources of a tenant currently showing a race in the configured window.
    pub fn raced_resources(&self, org_id: &OrgId) -> Vec<ResourceId> {
        let resources: Vec<ResourceId> = self
            .attempts
            .read()
            .keys()
            .filter(|(org, _)| org == org_id)
            .map(|(_, resource)| resource.clone())
            .collect();

        let mut raced: Vec<ResourceId> = resources
            .into_iter()
            .filter(|resource| self.is_race_detected_default(org_id, resource))
            .collect();
        raced.sort();
        raced
    }

    pub fn attempts(&self, org_id: &OrgId, resource: &ResourceId) -> Vec<AccessAttempt> {
        self.attempts
            .read()
            .get(&(org_id.clone(), resource.clone()))
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Another accessor wrote the same resource within the window of `attempt`.
    fn conflicts_with_others(&self, attempt: &AccessAttempt) -> bool {
        if attempt.operation != AccessOperation::Write {
            return false;
        }
        let window = window_millis(self.config.window());
        let attempts = self.attempts.read();
        attempts
            .get(&(attempt.org_id.clone(), attempt.resource_id.clone()))
            .is_some_and(|history| {
                history.iter().any(|other| {
                    other.operation == AccessOperation::Write
                        && other.accessor_id != attempt.accessor_id
                        && (attempt.timestamp - other.timestamp).num_milliseconds().abs() < window
                })
            })
    }
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
