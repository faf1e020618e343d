//! Health-driven exclusion and recovery

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exit_router::config::{HealthCheckConfig, RoutingConfig, SelectorStrategy};
use exit_router::error::{ArtifactKind, ProbeError};
use exit_router::health::{ExitProbe, HealthMonitor};
use exit_router::pool::ExitIp;
use exit_router::routing::{MemoryBackend, RoutingBackend, RoutingManager};
use parking_lot::Mutex;

use super::common::{eventually, harness, ip, pool, sink_server};

/// Replays a scripted sequence of outcomes per exit, then `default`
struct ScriptedProbe {
    scripts: Mutex<HashMap<IpAddr, VecDeque<bool>>>,
    default: Mutex<HashMap<IpAddr, bool>>,
}

impl ScriptedProbe {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, exit: IpAddr, outcomes: &[bool]) {
        self.scripts
            .lock()
            .insert(exit, outcomes.iter().copied().collect());
    }

    fn set_default(&self, exit: IpAddr, up: bool) {
        self.default.lock().insert(exit, up);
    }
}

#[async_trait]
impl ExitProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, exit: &ExitIp) -> Result<(), ProbeError> {
        let address = exit.address();
        let scripted = self
            .scripts
            .lock()
            .get_mut(&address)
            .and_then(VecDeque::pop_front);
        let up = scripted
            .or_else(|| self.default.lock().get(&address).copied())
            .unwrap_or(true);
        if up {
            Ok(())
        } else {
            Err(ProbeError::ConnectFailed {
                exit: address,
                target: "192.0.2.1:443".parse().unwrap(),
                reason: "scripted failure".into(),
            })
        }
    }
}

fn monitor(
    pool: &Arc<exit_router::pool::ExitPool>,
    probe: &Arc<ScriptedProbe>,
    threshold: u32,
) -> Arc<HealthMonitor> {
    let config = HealthCheckConfig {
        recovery_threshold: threshold,
        ..HealthCheckConfig::default()
    };
    Arc::new(
        HealthMonitor::new(
            Arc::clone(pool),
            Arc::clone(probe) as Arc<dyn ExitProbe>,
            &config,
        )
        .with_timing(Duration::from_millis(20), Duration::from_millis(200)),
    )
}

#[tokio::test]
async fn test_demotion_within_one_round() {
    let h = harness(3, SelectorStrategy::RoundRobin);
    let probe = Arc::new(ScriptedProbe::new());
    probe.set_default(ip("10.0.0.2"), false);
    let monitor = monitor(&h.pool, &probe, 3);

    let report = monitor.check_once().await;
    assert_eq!(report.demoted, vec![ip("10.0.0.2")]);

    let target = sink_server().await;
    for _ in 0..30 {
        let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
        assert_ne!(conn.exit(), ip("10.0.0.2"));
    }
}

#[tokio::test]
async fn test_promotion_only_after_threshold() {
    let h = harness(2, SelectorStrategy::RoundRobin);
    let probe = Arc::new(ScriptedProbe::new());
    // down, up, up, down, up, up, up
    probe.script(
        ip("10.0.0.1"),
        &[false, true, true, false, true, true, true],
    );
    let monitor = monitor(&h.pool, &probe, 3);

    let healthy = || h.pool.snapshot().get(ip("10.0.0.1")).unwrap().healthy;

    monitor.check_once().await;
    assert!(!healthy());
    monitor.check_once().await;
    monitor.check_once().await;
    assert!(!healthy(), "two successes must not promote");
    monitor.check_once().await;
    assert!(!healthy());
    monitor.check_once().await;
    monitor.check_once().await;
    assert!(!healthy());
    let report = monitor.check_once().await;
    assert_eq!(report.promoted, vec![ip("10.0.0.1")]);
    assert!(healthy());

    let stats = monitor.stats();
    let entry = stats
        .exits
        .iter()
        .find(|e| e.address == ip("10.0.0.1"))
        .unwrap();
    assert_eq!(entry.stats.demotions, 1);
    assert_eq!(entry.stats.total_failures, 2);
    assert_eq!(entry.stats.promotions, 1);
}

#[tokio::test]
async fn test_background_monitor_fails_over_and_back() {
    let h = harness(2, SelectorStrategy::DestinationBased);
    let probe = Arc::new(ScriptedProbe::new());
    let monitor = monitor(&h.pool, &probe, 2);
    let handle = tokio::spawn(Arc::clone(&monitor).run());

    let target = sink_server().await;
    let sticky = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
    let preferred = sticky.exit();
    sticky.finish();

    probe.set_default(preferred, false);
    assert!(eventually(|| !h.pool.snapshot().get(preferred).unwrap().healthy).await);

    let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
    assert_ne!(conn.exit(), preferred);
    conn.finish();

    probe.set_default(preferred, true);
    assert!(eventually(|| h.pool.snapshot().get(preferred).unwrap().healthy).await);
    let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
    assert_eq!(conn.exit(), preferred);

    monitor.shutdown();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_open_connections_survive_demotion() {
    let h = harness(2, SelectorStrategy::RoundRobin);
    let probe = Arc::new(ScriptedProbe::new());
    let monitor = monitor(&h.pool, &probe, 1);
    let target = sink_server().await;

    let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
    let exit = h.pool.get(conn.exit()).unwrap();
    probe.set_default(exit.address(), false);
    monitor.check_once().await;

    assert!(!h.pool.snapshot().get(exit.address()).unwrap().healthy);
    assert_eq!(exit.active_connections(), 1);
    conn.finish();
    assert_eq!(exit.active_connections(), 0);
}

#[tokio::test]
async fn test_readmitted_exit_recovers_through_threshold() {
    let pool = pool(2);
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_install(ip("10.0.0.2"), ArtifactKind::Snat);
    let routing = RoutingManager::new(
        &RoutingConfig::default(),
        Arc::clone(&backend) as Arc<dyn RoutingBackend>,
    )
    .unwrap();
    let checks = Arc::new(ScriptedProbe::new());
    checks.set_default(ip("10.0.0.2"), false);
    let monitor = monitor(&pool, &checks, 2);

    assert!(routing.setup(&pool).is_err());
    backend.clear_failures();
    routing.setup(&pool).unwrap();

    let healthy = || pool.snapshot().get(ip("10.0.0.2")).unwrap().healthy;
    assert!(!healthy());

    assert!(monitor.check_once().await.promoted.is_empty());
    assert!(!healthy(), "a failing exit must stay out after re-admission");

    checks.set_default(ip("10.0.0.2"), true);
    assert!(monitor.check_once().await.promoted.is_empty());
    assert_eq!(monitor.check_once().await.promoted, vec![ip("10.0.0.2")]);
    assert!(healthy());

    checks.set_default(ip("10.0.0.2"), false);
    assert_eq!(monitor.check_once().await.demoted, vec![ip("10.0.0.2")]);
    assert!(!healthy());
}
