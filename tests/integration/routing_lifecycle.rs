//! Routing setup / teardown against live pool state

use std::sync::Arc;

use exit_router::config::{DialConfig, ExitConfig, RoutingConfig, SelectorStrategy};
use exit_router::dialer::ExitDialer;
use exit_router::error::{ArtifactKind, DialError, RoutingError};
use exit_router::pool::ExitPool;
use exit_router::routing::{MemoryBackend, RoutingBackend, RoutingManager, RoutingState};
use exit_router::selector::IpSelector;

use super::common::{harness, ip, pool, sink_server};

fn manager(backend: &Arc<MemoryBackend>) -> Arc<RoutingManager> {
    Arc::new(
        RoutingManager::new(
            &RoutingConfig::default(),
            Arc::clone(backend) as Arc<dyn RoutingBackend>,
        )
        .unwrap(),
    )
}

#[test]
fn test_double_setup_creates_no_duplicates() {
    let pool = pool(3);
    let backend = Arc::new(MemoryBackend::new());
    let routing = manager(&backend);

    routing.setup(&pool).unwrap();
    routing.setup(&pool).unwrap();

    assert_eq!(backend.installed_count(), 9);
    assert_eq!(backend.created(), 9);
    assert_eq!(routing.stats().provisioned_exits, 3);
    for exit in pool.exits() {
        assert_eq!(
            backend.installed_for(exit.address()),
            vec![ArtifactKind::Route, ArtifactKind::PolicyRule, ArtifactKind::Snat]
        );
    }
}

#[test]
fn test_table_ids_are_distinct_and_above_reserved_range() {
    let pool = pool(3);
    let backend = Arc::new(MemoryBackend::new());
    let routing = manager(&backend);
    routing.setup(&pool).unwrap();

    let mut ids: Vec<u32> = pool.exits().iter().filter_map(|e| e.table_id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|&id| id > 255));
}

#[test]
fn test_cleanup_after_health_change_removes_everything() {
    let pool = pool(3);
    let backend = Arc::new(MemoryBackend::new());
    let routing = manager(&backend);
    routing.setup(&pool).unwrap();

    pool.mark_healthy(ip("10.0.0.1"), false).unwrap();
    pool.mark_healthy(ip("10.0.0.3"), false).unwrap();
    pool.mark_healthy(ip("10.0.0.3"), true).unwrap();

    routing.cleanup().unwrap();
    assert_eq!(backend.installed_count(), 0);
    assert_eq!(backend.removed(), backend.created());
    assert_eq!(routing.state(), RoutingState::Uninitialized);
    assert!(pool.exits().iter().all(|e| e.table_id().is_none()));
}

#[tokio::test]
async fn test_partial_failure_excludes_exit_from_dialing() {
    let pool = pool(3);
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_install(ip("10.0.0.2"), ArtifactKind::Snat);
    let routing = manager(&backend);

    let err = routing.setup(&pool).unwrap_err();
    match &err {
        RoutingError::SetupPartialFailure { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].exit, ip("10.0.0.2"));
            assert_eq!(failures[0].artifact, Some(ArtifactKind::Snat));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Rolled back: nothing of 10.0.0.2 left behind
    assert!(backend.installed_for(ip("10.0.0.2")).is_empty());
    assert!(routing.is_ready());

    let dialer = ExitDialer::new(
        Arc::clone(&pool),
        Arc::new(IpSelector::new(SelectorStrategy::RoundRobin)),
        Arc::clone(&routing),
        &DialConfig::default(),
    );
    let target = sink_server().await;
    for _ in 0..20 {
        let conn = dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
        assert_ne!(conn.exit(), ip("10.0.0.2"));
    }

    // Health checks cannot bring back an exit without routing
    assert!(!pool.mark_healthy(ip("10.0.0.2"), true).unwrap());
    assert!(!pool.snapshot().get(ip("10.0.0.2")).unwrap().is_selectable());
}

#[test]
fn test_setup_retry_readmits_failed_exit() {
    let pool = pool(2);
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_install(ip("10.0.0.1"), ArtifactKind::Route);
    let routing = manager(&backend);

    assert!(routing.setup(&pool).is_err());
    assert_eq!(pool.snapshot().selectable_count(), 1);

    backend.clear_failures();
    routing.setup(&pool).unwrap();
    assert_eq!(backend.installed_count(), 6);

    // Routable again, but promotion is left to health checking
    let snap = pool.snapshot();
    assert!(snap.get(ip("10.0.0.1")).unwrap().routable);
    assert_eq!(snap.selectable_count(), 1);

    assert!(pool.mark_healthy(ip("10.0.0.1"), true).unwrap());
    assert_eq!(pool.snapshot().selectable_count(), 2);
}

#[test]
fn test_missing_interface_reported_per_exit() {
    let pool = Arc::new(ExitPool::from_config(&[
        ExitConfig::new(ip("10.0.0.1"), "eth0", ip("10.0.0.254")),
        ExitConfig::new(ip("10.1.0.1"), "eth9", ip("10.1.0.254")),
    ]));
    let backend = Arc::new(MemoryBackend::new());
    backend.remove_interface("eth9");
    let routing = manager(&backend);

    let err = routing.setup(&pool).unwrap_err();
    let failures = err.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].exit, ip("10.1.0.1"));
    assert_eq!(pool.snapshot().selectable_count(), 1);
}

#[tokio::test]
async fn test_dial_after_cleanup_fails_closed() {
    let h = harness(2, SelectorStrategy::RoundRobin);
    let target = sink_server().await;

    let open = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
    h.routing.cleanup().unwrap();
    assert_eq!(h.backend.installed_count(), 0);

    // No fallback to the default route once steering is torn down
    let err = h
        .dialer
        .dial_for_target("127.0.0.1", target.port())
        .await
        .unwrap_err();
    assert!(matches!(err, DialError::BindFailed { .. }));

    // The open session still ends cleanly
    open.finish();
    for exit in h.pool.exits() {
        assert_eq!(exit.load(), 0);
    }
}
