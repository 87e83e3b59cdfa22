//! End-to-end arbitration scenarios against `ArbitrationService`.

use std::time::{Duration, Instant};

use labgate_core::{ArbitrationConfig, ArbitrationError, EquipmentId, SessionId};
use labgate_server::concurrency::{
    AcquireOutcome, DenialReason, EquipmentMode, LockEventKind, LockMode, ReleaseOutcome,
    SessionMetadata,
};
use labgate_server::service::ArbitrationService;

fn service() -> ArbitrationService {
    ArbitrationService::new(ArbitrationConfig::default())
}

fn open(svc: &ArbitrationService, id: &str) -> SessionId {
    svc.create_session(Some(SessionId::from(id)), SessionMetadata::default())
        .unwrap()
        .session_id
}

fn event_log(svc: &ArbitrationService, equipment: &EquipmentId) -> Vec<(LockEventKind, String)> {
    svc.list_events(equipment)
        .into_iter()
        .map(|e| (e.kind, e.session_id.map(|s| s.0).unwrap_or_default()))
        .collect()
}

#[test]
fn queued_session_is_granted_when_holder_releases() {
    let svc = service();
    let (s1, s2) = (open(&svc, "S1"), open(&svc, "S2"));
    let scope = EquipmentId::from("scope-1");
    let lease = Some(Duration::from_secs(30));

    let first = svc.acquire(&scope, &s1, LockMode::Exclusive, lease).unwrap();
    assert!(first.is_granted());

    let second = svc.acquire(&scope, &s2, LockMode::Exclusive, lease).unwrap();
    assert_eq!(
        second,
        AcquireOutcome::Queued {
            position: 1,
            holder: s1.clone(),
        }
    );
    assert_eq!(svc.status(&scope).queue_depth, 1);

    assert_eq!(
        svc.release(&scope, &s1),
        ReleaseOutcome::Released {
            promoted: Some(s2.clone()),
        }
    );
    assert!(svc.can_control(&scope, &s2));

    assert_eq!(
        event_log(&svc, &scope),
        vec![
            (LockEventKind::Acquired, "S1".to_string()),
            (LockEventKind::Queued, "S2".to_string()),
            (LockEventKind::Released, "S1".to_string()),
            (LockEventKind::Acquired, "S2".to_string()),
        ]
    );
}

#[test]
fn observer_blocks_exclusive_until_its_session_ends() {
    let svc = service();
    let (s1, s2) = (open(&svc, "S1"), open(&svc, "S2"));
    let psu = EquipmentId::from("psu-1");

    assert!(svc.acquire(&psu, &s1, LockMode::Observe, None).unwrap().is_granted());
    assert_eq!(
        svc.acquire(&psu, &s2, LockMode::Exclusive, None).unwrap(),
        AcquireOutcome::Denied {
            reason: DenialReason::Observed {
                observers: vec![s1.clone()],
            },
        }
    );

    svc.end_session(&s1).unwrap();
    assert!(svc.acquire(&psu, &s2, LockMode::Exclusive, None).unwrap().is_granted());
}

#[test]
fn unrenewed_lease_expires_in_the_cleanup_sweep() {
    let svc = service();
    let s1 = open(&svc, "S1");
    let load = EquipmentId::from("load-1");
    let t0 = Instant::now();

    svc.locks()
        .acquire_at(&load, &s1, LockMode::Exclusive, Some(Duration::from_secs(30)), t0);

    let report = svc.cleanup().run_once_at(t0 + Duration::from_secs(31));
    assert_eq!(report.expired_leases.len(), 1);
    assert_eq!(report.expired_leases[0].equipment_id, load);

    assert_eq!(svc.locks().status_at(&load, t0 + Duration::from_secs(31)).mode, EquipmentMode::None);
    assert_eq!(
        event_log(&svc, &load).last(),
        Some(&(LockEventKind::Expired, "S1".to_string()))
    );
}

#[test]
fn fifo_order_is_independent_of_unrelated_releases() {
    let svc = service();
    let holder = open(&svc, "H");
    let (a, b) = (open(&svc, "A"), open(&svc, "B"));
    let scope = EquipmentId::from("scope-1");
    let other = EquipmentId::from("psu-1");

    svc.acquire(&scope, &holder, LockMode::Exclusive, None).unwrap();
    svc.acquire(&other, &b, LockMode::Exclusive, None).unwrap();
    svc.acquire(&scope, &a, LockMode::Exclusive, None).unwrap();
    svc.acquire(&scope, &b, LockMode::Exclusive, None).unwrap();
    svc.release(&other, &b);

    svc.release(&scope, &holder);
    assert!(svc.can_control(&scope, &a));
    svc.release(&scope, &a);
    assert!(svc.can_control(&scope, &b));
}

#[test]
fn session_end_purges_every_queue() {
    let svc = service();
    let (h1, h2, w) = (open(&svc, "H1"), open(&svc, "H2"), open(&svc, "W"));
    let scope = EquipmentId::from("scope-1");
    let load = EquipmentId::from("load-1");

    svc.acquire(&scope, &h1, LockMode::Exclusive, None).unwrap();
    svc.acquire(&load, &h2, LockMode::Exclusive, None).unwrap();
    svc.acquire(&scope, &w, LockMode::Exclusive, None).unwrap();
    svc.acquire(&load, &w, LockMode::Exclusive, None).unwrap();

    assert!(svc.end_session(&w).unwrap().is_empty());
    assert!(svc.list_queue(&scope).is_empty());
    assert!(svc.list_queue(&load).is_empty());

    assert_eq!(
        svc.release(&scope, &h1),
        ReleaseOutcome::Released { promoted: None }
    );
}

#[test]
fn expired_session_cascades_through_the_sweep() {
    let svc = ArbitrationService::new(ArbitrationConfig {
        session_timeout_sec: 60,
        ..ArbitrationConfig::default()
    });
    let t0 = Instant::now();
    let s1 = svc
        .sessions()
        .create_at(Some(SessionId::from("S1")), SessionMetadata::default(), t0)
        .unwrap()
        .session_id;
    let s2 = svc
        .sessions()
        .create_at(Some(SessionId::from("S2")), SessionMetadata::default(), t0)
        .unwrap()
        .session_id;
    let scope = EquipmentId::from("scope-1");
    svc.locks()
        .acquire_at(&scope, &s1, LockMode::Exclusive, None, t0);
    svc.locks()
        .acquire_at(&scope, &s2, LockMode::Exclusive, None, t0);
    svc.sessions()
        .touch_at(&s2, t0 + Duration::from_secs(50))
        .unwrap();

    let report = svc.cleanup().run_once_at(t0 + Duration::from_secs(61));
    assert_eq!(report.expired_sessions, vec![s1]);
    assert!(svc.locks().holds_exclusive(&scope, &s2));
}

#[test]
fn kill_switch_lets_everyone_control() {
    let svc = ArbitrationService::new(ArbitrationConfig {
        enable_equipment_locks: false,
        ..ArbitrationConfig::default()
    });
    let (s1, s2) = (open(&svc, "S1"), open(&svc, "S2"));
    let scope = EquipmentId::from("scope-1");
    svc.acquire(&scope, &s1, LockMode::Exclusive, None).unwrap();

    assert!(svc.can_control(&scope, &s2));
    assert!(svc.authorize(&scope, &s2, "output_on").is_ok());
}

#[test]
fn control_denied_to_everyone_but_the_holder() {
    let svc = service();
    let (s1, s2) = (open(&svc, "S1"), open(&svc, "S2"));
    let scope = EquipmentId::from("scope-1");
    svc.acquire(&scope, &s1, LockMode::Exclusive, None).unwrap();

    assert!(svc.can_control(&scope, &s1));
    assert!(!svc.can_control(&scope, &s2));
    assert!(matches!(
        svc.authorize(&scope, &s2, "set_voltage"),
        Err(ArbitrationError::PermissionDenied { .. })
    ));
}

#[test]
fn commanding_without_heartbeats_keeps_session_and_lease() {
    let svc = ArbitrationService::new(ArbitrationConfig {
        lock_timeout_sec: 30,
        session_timeout_sec: 60,
        ..ArbitrationConfig::default()
    });
    let t0 = Instant::now();
    let s1 = svc
        .sessions()
        .create_at(Some(SessionId::from("S1")), SessionMetadata::default(), t0)
        .unwrap()
        .session_id;
    let psu = EquipmentId::from("psu-1");
    svc.locks().acquire_at(&psu, &s1, LockMode::Exclusive, None, t0);

    for i in 1..=7 {
        let t = t0 + Duration::from_secs(10 * i);
        svc.gate().check_at(&psu, &s1, "set_voltage", t).unwrap();
        assert!(svc.cleanup().run_once_at(t).is_empty());
    }

    assert!(svc.locks().holds_exclusive(&psu, &s1));
    assert!(svc.get_session(&s1).is_ok());
}

#[test]
fn acquire_after_session_end_grants_nothing() {
    let svc = service();
    let s1 = open(&svc, "S1");
    let scope = EquipmentId::from("scope-1");
    svc.end_session(&s1).unwrap();

    assert_eq!(
        svc.acquire(&scope, &s1, LockMode::Exclusive, None).unwrap_err(),
        ArbitrationError::SessionNotFound(s1)
    );
    assert_eq!(svc.status(&scope).mode, EquipmentMode::None);
}

#[test]
fn session_end_racing_acquires_leaves_no_lease_behind() {
    let benches: Vec<EquipmentId> = (0..32)
        .map(|i| EquipmentId::from(format!("bench-{i}")))
        .collect();

    for round in 0..20 {
        let svc = service();
        let s1 = open(&svc, "S1");
        std::thread::scope(|threads| {
            threads.spawn(|| {
                for bench in &benches {
                    if svc.acquire(bench, &s1, LockMode::Exclusive, None).is_err() {
                        break;
                    }
                }
            });
            threads.spawn(|| svc.end_session(&s1).unwrap());
        });

        assert!(svc.get_session(&s1).is_err());
        assert!(svc.status_all().is_empty(), "round {round} left a lease held");
    }
}

#[tokio::test]
async fn promotion_is_pushed_to_subscribers() {
    let svc = service();
    let (s1, s2) = (open(&svc, "S1"), open(&svc, "S2"));
    let scope = EquipmentId::from("scope-1");
    svc.acquire(&scope, &s1, LockMode::Exclusive, None).unwrap();
    svc.acquire(&scope, &s2, LockMode::Exclusive, None).unwrap();

    let mut events = svc.subscribe();
    svc.release(&scope, &s1);

    loop {
        let event = events.recv().await.unwrap();
        if event.kind == LockEventKind::Acquired {
            assert!(event.involves(&s2));
            assert_eq!(event.reason.as_deref(), Some("promoted from queue"));
            break;
        }
    }
}
