//! End-to-end scenarios through the resilience core.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rampart::integration::{
    CommitParticipant, ConflictStrategy, IntegrationError, ServiceRegistration, ServiceState, Transaction,
    TransactionCoordinator, TransactionState,
};
use rampart::types::{AccessorId, ComponentId, HolderId, NodeId, ResourceId, ServiceId, SubscriberId};
use rampart::watchdog::{AccessOperation, CircuitState, DeadlockStatus, WatchdogError};
use rampart::{EscalationKind, OrgId, Profile, RampartConfig, ResilienceCore, Severity};
use serde_json::json;

/// Collects delivered sequence numbers.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<u64>>>);

impl Recorder {
    fn push(&self, sequence: u64) {
        self.0.lock().unwrap().push(sequence);
    }

    fn seen(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}

fn core() -> ResilienceCore {
    ResilienceCore::new(RampartConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_at_threshold_and_half_opens_after_timeout() {
    let core = core();
    let org = OrgId::new("acme");
    let payments = ComponentId::new("payments");
    let cascade = &core.watchdog().cascade;

    cascade.record_failure(&org, &payments, "timeout");
    cascade.record_failure(&org, &payments, "timeout");
    assert_eq!(cascade.circuit_state(&org, &payments), CircuitState::Closed);

    cascade.record_failure(&org, &payments, "timeout");
    assert_eq!(cascade.circuit_state(&org, &payments), CircuitState::Open);
    assert!(!cascade.allow_request(&org, &payments));

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(cascade.circuit_state(&org, &payments), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cascade.circuit_state(&org, &payments), CircuitState::HalfOpen);

    // Other tenants are unaffected.
    assert_eq!(
        cascade.circuit_state(&OrgId::new("globex"), &payments),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn cascade_is_isolated_and_streamed() -> anyhow::Result<()> {
    let core = core();
    let org = OrgId::new("acme");
    let mut stream = core.subscribe_escalations();
    let cascade = &core.watchdog().cascade;

    let db = ComponentId::new("db");
    let api = ComponentId::new("api");
    let worker = ComponentId::new("worker");

    cascade.record_failure(&org, &db, "disk full");
    cascade.record_cascading_failure(&org, &api, &db, "db write failed")?;
    assert!(!cascade.is_cascade_detected(&org));
    cascade.record_cascading_failure(&org, &worker, &api, "api 500")?;

    assert!(cascade.is_cascade_detected(&org));
    for component in [&db, &api, &worker] {
        assert!(cascade.is_component_isolated(&org, component));
        assert!(!core.integration().integrator.route_allowed(&org, component));
    }
    assert_eq!(cascade.cascade_depth(&org), 3);

    let escalation = stream.recv().await?;
    assert_eq!(escalation.kind, EscalationKind::CascadingFailure);
    assert_eq!(escalation.org_id, org);
    Ok(())
}

#[test]
fn cascading_failure_requires_known_cause() {
    let core = core();
    let err = core
        .watchdog()
        .cascade
        .record_cascading_failure(
            &OrgId::new("acme"),
            &ComponentId::new("api"),
            &ComponentId::new("ghost"),
            "?",
        )
        .unwrap_err();
    assert!(matches!(err, WatchdogError::UnknownCause { .. }));
}

#[test]
fn two_party_deadlock_detected_and_resolved() {
    let core = core();
    let org = OrgId::new("acme");
    let deadlock = &core.watchdog().deadlock;
    let (r1, r2) = (ResourceId::new("R1"), ResourceId::new("R2"));
    let (a, b) = (HolderId::new("A"), HolderId::new("B"));

    assert!(deadlock.acquire_lock(&org, &r1, &a).is_some());
    assert!(deadlock.acquire_lock(&org, &r2, &b).is_some());
    deadlock.request_lock(&org, &r2, &a);
    assert_eq!(deadlock.detect_deadlock(&org), DeadlockStatus::None);

    deadlock.request_lock(&org, &r1, &b);
    assert!(deadlock.detect_deadlock(&org).is_detected());

    let recovery = deadlock.resolve(&org).unwrap().unwrap();
    assert!(!recovery.holders_released.is_empty());
    assert_eq!(deadlock.detect_deadlock(&org), DeadlockStatus::None);
}

#[test]
fn race_window_boundaries() {
    let core = core();
    let org = OrgId::new("acme");
    let race = &core.watchdog().race;
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    let close = ResourceId::new("balance");
    race.attempt_access_at(&org, &close, &AccessorId::new("t1"), AccessOperation::Write, base);
    race.attempt_access_at(
        &org,
        &close,
        &AccessorId::new("t2"),
        AccessOperation::Write,
        base + chrono::Duration::milliseconds(10),
    );
    assert!(race.is_race_detected(&org, &close, Duration::from_millis(100)));

    let apart = ResourceId::new("ledger");
    race.attempt_access_at(&org, &apart, &AccessorId::new("t1"), AccessOperation::Write, base);
    race.attempt_access_at(
        &org,
        &apart,
        &AccessorId::new("t2"),
        AccessOperation::Write,
        base + chrono::Duration::milliseconds(500),
    );
    assert!(!race.is_race_detected(&org, &apart, Duration::from_millis(100)));
}

#[test]
fn events_are_ordered_per_tenant() {
    let core = core();
    let bus = &core.integration().bus;
    let (acme, globex) = (OrgId::new("acme"), OrgId::new("globex"));
    let recorder = Recorder::default();

    let sink = recorder.clone();
    bus.subscribe(&acme, &SubscriberId::new("audit"), vec![], move |event| {
        sink.push(event.sequence);
        Ok(())
    });

    for i in 0..5 {
        bus.publish(&acme, "tick", json!({ "i": i }));
        bus.publish(&globex, "tick", json!({ "i": i }));
    }

    assert_eq!(recorder.seen(), vec![1, 2, 3, 4, 5]);
    assert!(bus.verify_ordering(&acme));
    assert!(bus.verify_ordering(&globex));
    assert_eq!(bus.next_sequence(&globex), 6);
}

#[test]
fn committed_transaction_cannot_roll_back() {
    let core = core();
    let org = OrgId::new("acme");
    let transactions = &core.integration().transactions;

    let txn = transactions.begin(&org, vec![ComponentId::new("orders")], vec![]);
    transactions.commit(&org, txn.id).unwrap();

    let err = transactions.rollback(&org, txn.id, Some("too late")).unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::InvalidTransition {
            from: TransactionState::Committed,
            ..
        }
    ));
    assert!(err.is_validation());
    assert_eq!(
        core.integration()
            .bus
            .published_events(&org, Some("transaction.committed"))
            .len(),
        1
    );
}

#[test]
fn preserved_state_round_trips_within_tenant() {
    let core = core();
    let system = &core.watchdog().system;
    let acme = OrgId::new("acme");

    system.preserve_state(&acme, "sessions", json!([{ "id": 1 }, { "id": 2 }]));
    assert_eq!(
        system.restore_state(&acme, "sessions"),
        Some(json!([{ "id": 1 }, { "id": 2 }]))
    );
    assert_eq!(system.restore_state(&OrgId::new("globex"), "sessions"), None);
}

#[test]
fn source_wins_takes_first_listed_component() {
    let core = core();
    let (a, b) = (ComponentId::new("A"), ComponentId::new("B"));
    let values = BTreeMap::from([(a.clone(), json!("x")), (b.clone(), json!("y"))]);

    let conflict = core.integration().consistency.resolve_conflict(
        &OrgId::new("acme"),
        &[a, b],
        "k",
        values,
        ConflictStrategy::SourceWins,
    );
    assert_eq!(conflict.resolved_value, Some(json!("x")));
}

#[tokio::test]
async fn unregistered_service_is_offline() {
    let core = core();
    let result = core
        .integration()
        .services
        .perform_health_check(&OrgId::new("acme"), &ServiceId::new("svc-x"))
        .await;
    assert_eq!(result.state, ServiceState::Offline);
}

#[tokio::test]
async fn health_sweep_checks_every_service() {
    let core = core();
    let org = OrgId::new("acme");
    let services = &core.integration().services;
    services.register_service(&org, ServiceRegistration::new("billing", "Billing", "10.0.0.1", 8080));
    services.register_service(&org, ServiceRegistration::new("ledger", "Ledger", "10.0.0.2", 8080));

    let results = core.health_sweep(&org).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.state == ServiceState::Healthy));
}

#[tokio::test]
async fn system_failure_pauses_delivery_and_stops_monitors() {
    let core = core();
    let org = OrgId::new("acme");
    let recorder = Recorder::default();
    let sink = recorder.clone();
    core.integration()
        .bus
        .subscribe(&org, &SubscriberId::new("ops"), vec![], move |event| {
            sink.push(event.sequence);
            Ok(())
        });

    let monitor = core
        .integration()
        .consistency
        .monitor(&org, vec![ComponentId::new("a")], vec!["k".into()], Some(Duration::from_secs(60)))
        .unwrap();
    let handle = core.spawn_consistency_monitor(&org, monitor.monitor_id);

    core.watchdog()
        .system
        .preserve_state(&org, "queue", json!({ "pending": 3 }));
    let outcome = core.handle_system_failure(&org, "datacenter power loss");

    assert_eq!(outcome.escalation.kind, EscalationKind::SystemWideFailure);
    assert_eq!(outcome.escalation.severity, Severity::Critical);
    assert!(core.watchdog().system.is_tenant_shut_down(&org));
    assert!(core.is_tenant_shut_down(&org));
    assert!(!core.watchdog().system.is_shutdown_initiated());
    assert!(!core.is_shutting_down());

    // The announcement is delivered, later events are held.
    assert_eq!(recorder.seen(), vec![1]);
    core.integration().bus.publish(&org, "late", json!({}));
    assert_eq!(recorder.seen(), vec![1]);
    assert_eq!(core.integration().bus.resume(&org), 1);
    assert_eq!(recorder.seen(), vec![1, 2]);

    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn tenant_failure_leaves_other_tenants_running() {
    let core = core();
    let (acme, globex) = (OrgId::new("acme"), OrgId::new("globex"));
    let consistency = &core.integration().consistency;

    let spawn = |org: &OrgId| {
        let monitor = consistency
            .monitor(org, vec![ComponentId::new("a")], vec!["k".into()], Some(Duration::from_secs(10)))
            .unwrap();
        core.spawn_consistency_monitor(org, monitor.monitor_id)
    };
    let acme_monitor = spawn(&acme);
    let globex_monitor = spawn(&globex);

    let globex_seen = Recorder::default();
    let sink = globex_seen.clone();
    core.integration()
        .bus
        .subscribe(&globex, &SubscriberId::new("ops"), vec![], move |event| {
            sink.push(event.sequence);
            Ok(())
        });
    let mut globex_escalations = core.subscribe_tenant_escalations(&globex);

    core.handle_system_failure(&acme, "rack fire");
    acme_monitor.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!globex_monitor.is_finished());
    assert!(!core.is_tenant_shut_down(&globex));
    assert!(!core.watchdog().system.is_tenant_shut_down(&globex));

    core.integration().bus.publish(&globex, "tick", json!({}));
    assert_eq!(globex_seen.seen(), vec![1]);
    assert!(globex_escalations.try_recv().is_err());

    core.shutdown();
    assert!(core.is_tenant_shut_down(&globex));
    assert!(globex_monitor.await.unwrap().unwrap() > 10);
}

#[tokio::test]
async fn monitor_of_another_tenant_cannot_be_spawned() {
    let core = core();
    let monitor = core
        .integration()
        .consistency
        .monitor(&OrgId::new("acme"), vec![ComponentId::new("a")], vec!["k".into()], None)
        .unwrap();

    let err = core
        .spawn_consistency_monitor(&OrgId::new("globex"), monitor.monitor_id)
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, IntegrationError::MonitorNotFound(id) if id == monitor.monitor_id));
}

/// Participant that tries to roll the transaction back from its commit hook.
struct LateRollback {
    transactions: Arc<TransactionCoordinator>,
    rolled_back: Mutex<Option<bool>>,
}

impl CommitParticipant for LateRollback {
    fn id(&self) -> NodeId {
        NodeId::new("late")
    }

    fn prepare(&self, _transaction: &Transaction) -> bool {
        true
    }

    fn commit(&self, transaction: &Transaction) {
        let result = self
            .transactions
            .rollback(&transaction.org_id, transaction.id, Some("changed my mind"));
        *self.rolled_back.lock().unwrap() = Some(result.is_ok());
    }

    fn abort(&self, _transaction: &Transaction) {}
}

#[test]
fn rollback_from_commit_phase_is_refused() {
    let core = core();
    let org = OrgId::new("acme");
    let transactions = core.integration().transactions.clone();

    let txn = transactions.begin(&org, vec![ComponentId::new("orders")], vec![]);
    let late = Arc::new(LateRollback {
        transactions: transactions.clone(),
        rolled_back: Mutex::new(None),
    });
    let participants: Vec<Arc<dyn CommitParticipant>> = vec![late.clone()];

    let outcome = transactions.two_phase_commit(&org, txn.id, &participants).unwrap();

    assert!(outcome.committed);
    assert_eq!(*late.rolled_back.lock().unwrap(), Some(false));
    assert_eq!(transactions.get(&org, txn.id).unwrap().state, TransactionState::Committed);
    let bus = &core.integration().bus;
    assert_eq!(bus.published_events(&org, Some("transaction.committed")).len(), 1);
    assert!(bus.published_events(&org, Some("transaction.rolled_back")).is_empty());
}

#[test]
fn concurrent_publishers_deliver_in_sequence_order() {
    let core = Arc::new(core());
    let org = OrgId::new("acme");
    let recorder = Recorder::default();
    let sink = recorder.clone();
    core.integration()
        .bus
        .subscribe(&org, &SubscriberId::new("audit"), vec![], move |event| {
            sink.push(event.sequence);
            Ok(())
        });

    let publishers: Vec<_> = (0..4)
        .map(|worker| {
            let core = core.clone();
            let org = org.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    core.integration()
                        .bus
                        .publish(&org, "tick", json!({ "worker": worker, "i": i }));
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    assert_eq!(recorder.seen(), (1..=400).collect::<Vec<_>>());
    assert!(core.integration().bus.verify_ordering(&org));
}

#[test]
fn strict_profile_escalates_sooner() {
    let core = ResilienceCore::new(RampartConfig::for_profile(Profile::Strict)).unwrap();
    let org = OrgId::new("acme");

    core.integration()
        .integrator
        .handle_cross_component_error(
            &org,
            &ComponentId::new("db"),
            &[ComponentId::new("api"), ComponentId::new("worker")],
            "timeout",
            "slow queries",
            None,
        )
        .unwrap();

    assert_eq!(
        core.escalations()
            .escalations_of_kind(&org, EscalationKind::CrossComponentError)
            .len(),
        1
    );
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = RampartConfig::default();
    config.watchdog.circuit_breaker.failure_threshold = 0;
    assert!(ResilienceCore::new(config).is_err());
}

#[test]
fn core_is_shareable_across_tasks() {
    fn check<T: Send + Sync>() {}
    check::<Arc<ResilienceCore>>();
}
