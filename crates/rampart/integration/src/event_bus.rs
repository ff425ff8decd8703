//! Tenant-scoped, strictly ordered event bus.
//!
//! Sequence numbers are assigned under the tenant lock when an event is
//! enqueued. A single drain loop per tenant pushes pending events to the
//! matching subscriptions one at a time, so a publish made from inside a
//! callback is queued behind the event being delivered instead of recursing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rampart_types::{EscalationKind, EscalationLog, EventId, OrgId, RecordId, Severity, SubscriberId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

/// Subscriber callback. An `Err` marks the delivery as failed.
pub type EventCallback = Arc<dyn Fn(&Event) -> std::result::Result<(), String> + Send + Sync>;

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub org_id: OrgId,
    /// Per-tenant sequence, starting at 1.
    pub sequence: u64,
    pub delivered_to: Vec<SubscriberId>,
}

/// A subscriber's registration.
#[derive(Clone)]
pub struct Subscription {
    pub subscriber_id: SubscriberId,
    /// Event types of interest; empty or `"*"` means all.
    pub event_types: Vec<String>,
    pub org_id: OrgId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    callback: EventCallback,
}

impl Subscription {
    pub fn matches(&self, event: &Event) -> bool {
        self.active
            && self.org_id == event.org_id
            && (self.event_types.is_empty()
                || self
                    .event_types
                    .iter()
                    .any(|t| t == "*" || t == &event.event_type))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber_id", &self.subscriber_id)
            .field("event_types", &self.event_types)
            .field("org_id", &self.org_id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Recorded, no retry requested.
    Failed,
    /// Waiting for [`EventBus::redeliver_failed`].
    QueuedForRetry,
    /// Redelivery succeeded.
    Recovered,
    /// Redelivery failed and was escalated.
    Escalated,
    /// The subscription was gone when redelivery ran.
    Abandoned,
}

/// A failed delivery to one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub failure_id: RecordId,
    pub event_id: EventId,
    pub sequence: u64,
    pub subscriber_id: SubscriberId,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub org_id: OrgId,
    pub retry_count: u32,
    pub status: DeliveryStatus,
}

/// Per-tenant bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_events: u64,
    pub pending_events: usize,
    pub active_subscriptions: usize,
    pub deliveries: u64,
    pub failed_deliveries: usize,
    pub paused: bool,
    pub events_by_type: HashMap<String, u64>,
}

#[derive(Default)]
struct TenantBus {
    next_sequence: u64,
    events: Vec<Event>,
    subscriptions: Vec<Subscription>,
    pending: VecDeque<u64>,
    draining: bool,
    paused: bool,
    failures: Vec<DeliveryFailure>,
    redelivery: VecDeque<RecordId>,
    deliveries: u64,
    events_by_type: HashMap<String, u64>,
}

impl TenantBus {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            ..Default::default()
        }
    }

    fn event_mut(&mut self, sequence: u64) -> Option<&mut Event> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.events.get_mut(index)
    }

    fn event(&self, sequence: u64) -> Option<&Event> {
        let index = usize::try_from(sequence.checked_sub(1)?).ok()?;
        self.events.get(index)
    }
}

enum DrainStep {
    Deliver(Event, Vec<(SubscriberId, EventCallback)>),
    /// A pending sequence with no stored event.
    Skip,
    /// Paused or empty; `draining` has been cleared.
    Stop,
}

/// Clears the draining flag if a callback unwinds out of the drain loop.
struct DrainGuard<'a> {
    tenant: &'a Mutex<TenantBus>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tenant.lock().draining = false;
        }
    }
}

/// Ordered publish/subscribe bus with per-tenant isolation.
pub struct EventBus {
    tenants: DashMap<OrgId, Arc<Mutex<TenantBus>>>,
    escalations: Arc<EscalationLog>,
}

impl EventBus {
    pub fn new(escalations: Arc<EscalationLog>) -> Self {
        Self {
            tenants: DashMap::new(),
            escalations,
        }
    }

    /// Prepare the bus for a tenant. Idempotent.
    pub fn initialize(&self, org_id: &OrgId) -> bool {
        self.tenant(org_id);
        true
    }

    pub fn is_initialized(&self, org_id: &OrgId) -> bool {
        self.tenants.contains_key(org_id)
    }

    /// Sequence and store an event, then deliver it (and anything queued
    /// before it) unless the tenant is paused or a delivery is already
    /// running.
    ///
    /// Returns the stored event as it stands after this call's delivery.
    /// `delivered_to` is empty when the tenant is paused and may be partial
    /// when another thread is delivering.
    #[instrument(skip(self, payload), fields(org_id = %org_id))]
    pub fn publish(&self, org_id: &OrgId, event_type: &str, payload: Value) -> Event {
        let tenant = self.tenant(org_id);

        let (event, should_drain) = {
            let mut bus = tenant.lock();
            let sequence = bus.next_sequence;
            bus.next_sequence += 1;

            let event = Event {
                id: EventId::generate(),
                event_type: event_type.to_string(),
                payload,
                timestamp: Utc::now(),
                org_id: org_id.clone(),
                sequence,
                delivered_to: Vec::new(),
            };

            bus.events.push(event.clone());
            *bus.events_by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            bus.pending.push_back(sequence);

            let should_drain = !bus.draining && !bus.paused;
            if should_drain {
                bus.draining = true;
            }
            (event, should_drain)
        };

        debug!(sequence = event.sequence, event_type = %event.event_type, "Event published");

        if should_drain {
            self.drain(org_id, &tenant);
        }

        let stored = tenant.lock().event(event.sequence).cloned();
        stored.unwrap_or(event)
    }

    /// Register a subscriber. A second subscription for the same subscriber
    /// replaces the first, active or not; its delivery failures are kept and
    /// stay visible through [`failed_deliveries`](Self::failed_deliveries).
    pub fn subscribe<F>(
        &self,
        org_id: &OrgId,
        subscriber_id: &SubscriberId,
        event_types: Vec<String>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&Event) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let subscription = Subscription {
            subscriber_id: subscriber_id.clone(),
            event_types,
            org_id: org_id.clone(),
            active: true,
            created_at: Utc::now(),
            callback: Arc::new(callback),
        };

        let tenant = self.tenant(org_id);
        let mut bus = tenant.lock();
        bus.subscriptions.retain(|s| &s.subscriber_id != subscriber_id);
        bus.subscriptions.push(subscription.clone());

        info!(org_id = %org_id, subscriber = %subscriber_id, "Subscriber registered");
        subscription
    }

    /// Deactivate a subscriber. Returns false if it had no active subscription.
    pub fn unsubscribe(&self, org_id: &OrgId, subscriber_id: &SubscriberId) -> bool {
        let Some(tenant) = self.existing(org_id) else {
            return false;
        };
        let mut bus = tenant.lock();
        let mut found = false;
        for subscription in bus
            .subscriptions
            .iter_mut()
            .filter(|s| &s.subscriber_id == subscriber_id && s.active)
        {
            subscription.active = false;
            found = true;
        }
        if found {
            info!(org_id = %org_id, subscriber = %subscriber_id, "Subscriber deactivated");
        }
        found
    }

    pub fn subscriptions(&self, org_id: &OrgId) -> Vec<Subscription> {
        self.existing(org_id)
            .map(|tenant| tenant.lock().subscriptions.clone())
            .unwrap_or_default()
    }

    /// Events with `sequence >= from_sequence`, ascending, at most `limit`.
    pub fn events_in_order(&self, org_id: &OrgId, from_sequence: u64, limit: Option<usize>) -> Vec<Event> {
        let Some(tenant) = self.existing(org_id) else {
            return Vec::new();
        };
        let bus = tenant.lock();
        let mut events: Vec<Event> = bus
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    /// Published events, optionally filtered by type.
    pub fn published_events(&self, org_id: &OrgId, event_type: Option<&str>) -> Vec<Event> {
        self.existing(org_id)
            .map(|tenant| {
                tenant
                    .lock()
                    .events
                    .iter()
                    .filter(|e| event_type.map_or(true, |t| e.event_type == t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn event(&self, org_id: &OrgId, sequence: u64) -> Option<Event> {
        self.existing(org_id)
            .and_then(|tenant| tenant.lock().event(sequence).cloned())
    }

    /// Whether the tenant's sequence numbers run 1, 2, 3, ... with no gaps.
    pub fn verify_ordering(&self, org_id: &OrgId) -> bool {
        let Some(tenant) = self.existing(org_id) else {
            return true;
        };
        let bus = tenant.lock();
        bus.events
            .iter()
            .zip(1u64..)
            .all(|(event, expected)| event.sequence == expected)
    }

    pub fn next_sequence(&self, org_id: &OrgId) -> u64 {
        self.existing(org_id)
            .map_or(1, |tenant| tenant.lock().next_sequence)
    }

    /// Record a failed delivery. With `attempt_retry` the failure is queued
    /// for [`EventBus::redeliver_failed`]; the callback is never invoked here.
    pub fn handle_failure(
        &self,
        org_id: &OrgId,
        event: &Event,
        subscriber_id: &SubscriberId,
        error: &str,
        attempt_retry: bool,
    ) -> DeliveryFailure {
        let failure = DeliveryFailure {
            failure_id: RecordId::generate(),
            event_id: event.id,
            sequence: event.sequence,
            subscriber_id: subscriber_id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
            org_id: org_id.clone(),
            retry_count: 0,
            status: if attempt_retry {
                DeliveryStatus::QueuedForRetry
            } else {
                DeliveryStatus::Failed
            },
        };

        warn!(
            org_id = %org_id,
            subscriber = %subscriber_id,
            sequence = event.sequence,
            error = %error,
            retry = attempt_retry,
            "Event delivery failed"
        );

        let tenant = self.tenant(org_id);
        let mut bus = tenant.lock();
        bus.failures.push(failure.clone());
        if attempt_retry {
            bus.redelivery.push_back(failure.failure_id);
        }
        failure
    }

    /// Failed deliveries, optionally for one subscriber.
    pub fn failed_deliveries(&self, org_id: &OrgId, subscriber_id: Option<&SubscriberId>) -> Vec<DeliveryFailure> {
        self.existing(org_id)
            .map(|tenant| {
                tenant
                    .lock()
                    .failures
                    .iter()
                    .filter(|f| subscriber_id.map_or(true, |s| &f.subscriber_id == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-invoke each queued failure's callback once. Returns how many
    /// recovered; a second failure raises an `event_delivery_failure`
    /// escalation.
    pub fn redeliver_failed(&self, org_id: &OrgId) -> usize {
        let Some(tenant) = self.existing(org_id) else {
            return 0;
        };

        let queued: Vec<(RecordId, Option<(Event, SubscriberId, EventCallback)>)> = {
            let mut bus = tenant.lock();
            let ids: Vec<RecordId> = bus.redelivery.drain(..).collect();
            ids.into_iter()
                .map(|failure_id| {
                    let target = bus
                        .failures
                        .iter()
                        .find(|f| f.failure_id == failure_id)
                        .and_then(|failure| {
                            let event = bus.event(failure.sequence)?.clone();
                            let subscription = bus
                                .subscriptions
                                .iter()
                                .find(|s| s.subscriber_id == failure.subscriber_id && s.matches(&event))?;
                            Some((event, subscription.subscriber_id.clone(), subscription.callback.clone()))
                        });
                    (failure_id, target)
                })
                .collect()
        };

        let mut recovered = 0;
        for (failure_id, target) in queued {
            let Some((event, subscriber_id, callback)) = target else {
                self.update_failure(&tenant, failure_id, DeliveryStatus::Abandoned);
                continue;
            };

            match callback(&event) {
                Ok(()) => {
                    recovered += 1;
                    self.update_failure(&tenant, failure_id, DeliveryStatus::Recovered);
                    if let Some(stored) = tenant.lock().event_mut(event.sequence) {
                        stored.delivered_to.push(subscriber_id.clone());
                    }
                    info!(org_id = %org_id, subscriber = %subscriber_id, sequence = event.sequence, "Redelivery succeeded");
                }
                Err(error) => {
                    self.update_failure(&tenant, failure_id, DeliveryStatus::Escalated);
                    self.escalations.raise(
                        org_id,
                        EscalationKind::EventDeliveryFailure,
                        Severity::High,
                        json!({
                            "event_id": event.id.to_string(),
                            "sequence": event.sequence,
                            "subscriber_id": subscriber_id.as_str(),
                            "error": error,
                        }),
                    );
                }
            }
        }
        recovered
    }

    /// Hold delivery for a tenant. Events keep being sequenced and stored.
    pub fn pause(&self, org_id: &OrgId) {
        let tenant = self.tenant(org_id);
        tenant.lock().paused = true;
        info!(org_id = %org_id, "Event delivery paused");
    }

    /// Resume delivery and flush everything published while paused.
    /// Returns the number of events that were waiting.
    pub fn resume(&self, org_id: &OrgId) -> usize {
        let Some(tenant) = self.existing(org_id) else {
            return 0;
        };

        let (waiting, should_drain) = {
            let mut bus = tenant.lock();
            bus.paused = false;
            let waiting = bus.pending.len();
            let should_drain = !bus.draining && waiting > 0;
            if should_drain {
                bus.draining = true;
            }
            (waiting, should_drain)
        };

        info!(org_id = %org_id, waiting = waiting, "Event delivery resumed");
        if should_drain {
            self.drain(org_id, &tenant);
        }
        waiting
    }

    pub fn is_paused(&self, org_id: &OrgId) -> bool {
        self.existing(org_id).is_some_and(|tenant| tenant.lock().paused)
    }

    pub fn stats(&self, org_id: &OrgId) -> EventBusStats {
        let Some(tenant) = self.existing(org_id) else {
            return EventBusStats::default();
        };
        let bus = tenant.lock();
        EventBusStats {
            total_events: bus.events.len() as u64,
            pending_events: bus.pending.len(),
            active_subscriptions: bus.subscriptions.iter().filter(|s| s.active).count(),
            deliveries: bus.deliveries,
            failed_deliveries: bus.failures.len(),
            paused: bus.paused,
            events_by_type: bus.events_by_type.clone(),
        }
    }

    /// Deliver pending events in sequence order until the queue is empty or
    /// the tenant is paused. The caller must have set `draining`.
    fn drain(&self, org_id: &OrgId, tenant: &Arc<Mutex<TenantBus>>) {
        let mut guard = DrainGuard {
            tenant: tenant.as_ref(),
            armed: true,
        };

        loop {
            let step = {
                let mut bus = tenant.lock();
                if bus.paused {
                    bus.draining = false;
                    DrainStep::Stop
                } else {
                    match bus.pending.pop_front() {
                        Some(sequence) => match bus.event(sequence).cloned() {
                            Some(event) => {
                                let targets: Vec<(SubscriberId, EventCallback)> = bus
                                    .subscriptions
                                    .iter()
                                    .filter(|s| s.matches(&event))
                                    .map(|s| (s.subscriber_id.clone(), s.callback.clone()))
                                    .collect();
                                DrainStep::Deliver(event, targets)
                            }
                            None => DrainStep::Skip,
                        },
                        None => {
                            bus.draining = false;
                            DrainStep::Stop
                        }
                    }
                }
            };

            // Once `draining` is cleared under the lock another caller may own
            // the queue, so this loop must not touch it again.
            let (event, targets) = match step {
                DrainStep::Deliver(event, targets) => (event, targets),
                DrainStep::Skip => continue,
                DrainStep::Stop => break,
            };

            for (subscriber_id, callback) in targets {
                match callback(&event) {
                    Ok(()) => {
                        let mut bus = tenant.lock();
                        bus.deliveries += 1;
                        if let Some(stored) = bus.event_mut(event.sequence) {
                            stored.delivered_to.push(subscriber_id);
                        }
                    }
                    Err(error) => {
                        self.handle_failure(org_id, &event, &subscriber_id, &error, false);
                    }
                }
            }
        }

        guard.armed = false;
    }

    fn update_failure(&self, tenant: &Mutex<TenantBus>, failure_id: RecordId, status: DeliveryStatus) {
        let mut bus = tenant.lock();
        if let Some(failure) = bus.failures.iter_mut().find(|f| f.failure_id == failure_id) {
            failure.status = status;
            failure.retry_count += 1;
        }
    }

    fn tenant(&self, org_id: &OrgId) -> Arc<Mutex<TenantBus>> {
        self.tenants
            .entry(org_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TenantBus::new())))
            .clone()
    }

    fn existing(&self, org_id: &OrgId) -> Option<Arc<Mutex<TenantBus>>> {
        self.tenants.get(org_id).map(|entry| entry.value().clone())
    }
}
