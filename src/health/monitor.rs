//! Background health monitor
//!
//! Probes every routable exit once per interval, all exits concurrently,
//! and feeds the results through one [`ExitHealthTracker`] per exit. The
//! monitor is the only writer of exit health once the daemon is serving.
//!
//! ```text
//! interval tick -> snapshot -> join_all(timeout(probe(exit))) -> tracker -> pool.mark_healthy()
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::checker::{ExitHealthStats, ExitHealthTracker, HealthTransition};
use super::probe::ExitProbe;
use crate::config::HealthCheckConfig;
use crate::error::ProbeError;
use crate::pool::{ExitIp, ExitPool};

/// Result of one probe round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub probed: usize,
    pub failed: usize,
    pub demoted: Vec<IpAddr>,
    pub promoted: Vec<IpAddr>,
}

/// Monitor statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorStats {
    pub rounds: u64,
    pub exits: Vec<ExitHealthEntry>,
}

/// Health counters of one exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitHealthEntry {
    pub address: IpAddr,
    #[serde(flatten)]
    pub stats: ExitHealthStats,
}

/// Periodic prober driving exit health
pub struct HealthMonitor {
    pool: Arc<ExitPool>,
    probe: Arc<dyn ExitProbe>,
    interval: Duration,
    timeout: Duration,
    recovery_threshold: u32,
    trackers: RwLock<HashMap<IpAddr, Arc<ExitHealthTracker>>>,
    rounds: AtomicU64,
    active: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(pool: Arc<ExitPool>, probe: Arc<dyn ExitProbe>, config: &HealthCheckConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            pool,
            probe,
            interval: config.interval(),
            timeout: config.timeout(),
            recovery_threshold: config.recovery_threshold,
            trackers: RwLock::new(HashMap::new()),
            rounds: AtomicU64::new(0),
            active: AtomicBool::new(true),
            shutdown_tx,
        }
    }

    /// Override interval and per-probe timeout
    #[must_use]
    pub fn with_timing(mut self, interval: Duration, probe_timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = probe_timeout;
        self
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    fn tracker(&self, address: IpAddr, healthy: bool) -> Arc<ExitHealthTracker> {
        if let Some(tracker) = self.trackers.read().get(&address) {
            return Arc::clone(tracker);
        }
        let mut trackers = self.trackers.write();
        Arc::clone(trackers.entry(address).or_insert_with(|| {
            Arc::new(ExitHealthTracker::with_state(
                self.recovery_threshold,
                healthy,
            ))
        }))
    }

    async fn probe_exit(&self, exit: Arc<ExitIp>) -> (Arc<ExitIp>, Result<(), ProbeError>) {
        let result = match timeout(self.timeout, self.probe.probe(&exit)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout {
                exit: exit.address(),
            }),
        };
        (exit, result)
    }

    /// Run one probe round over every routable exit
    pub async fn check_once(&self) -> CheckReport {
        let snapshot = self.pool.snapshot();
        let mut probes = Vec::with_capacity(snapshot.len());

        for entry in snapshot.entries() {
            if !entry.routable {
                continue;
            }
            let tracker = self.tracker(entry.exit.address(), entry.healthy);
            // Follow pool changes made outside the monitor
            match (entry.healthy, tracker.is_healthy()) {
                (false, true) => {
                    tracker.force_unhealthy();
                }
                (true, false) => {
                    tracker.force_healthy();
                }
                _ => {}
            }
            probes.push(self.probe_exit(Arc::clone(&entry.exit)));
        }

        let results = join_all(probes).await;
        let mut report = CheckReport {
            probed: results.len(),
            ..CheckReport::default()
        };

        for (exit, result) in results {
            let address = exit.address();
            exit.record_health_check();
            let tracker = self.tracker(address, true);

            let transition = match &result {
                Ok(()) => tracker.record_success(),
                Err(e) => {
                    report.failed += 1;
                    debug!(exit = %address, error = %e, "Health probe failed");
                    tracker.record_failure()
                }
            };

            match transition {
                HealthTransition::Demoted => {
                    let _ = self.pool.mark_healthy(address, false);
                    warn!(
                        exit = %address,
                        error = %result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
                        "Exit transitioned to UNHEALTHY"
                    );
                    report.demoted.push(address);
                }
                HealthTransition::Promoted => {
                    // The pool refuses promotion if routing excluded the exit meanwhile
                    if self.pool.mark_healthy(address, true).unwrap_or(false) {
                        info!(
                            exit = %address,
                            consecutive_successes = tracker.consecutive_successes(),
                            "Exit transitioned to HEALTHY"
                        );
                        report.promoted.push(address);
                    }
                }
                HealthTransition::Unchanged => {}
            }
        }

        self.rounds.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Probe on every interval tick until [`HealthMonitor::shutdown`]
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.is_active() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            probe = self.probe.name(),
            exits = self.pool.len(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check_once().await;
                    if !report.demoted.is_empty() || !report.promoted.is_empty() {
                        info!(
                            probed = report.probed,
                            failed = report.failed,
                            demoted = report.demoted.len(),
                            promoted = report.promoted.len(),
                            "Health check round changed exit health"
                        );
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Health monitor shutdown signal received");
                    return;
                }
            }
        }
    }

    /// Stop a running (or future) `run()`
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> HealthMonitorStats {
        let trackers = self.trackers.read();
        let mut exits: Vec<ExitHealthEntry> = trackers
            .iter()
            .map(|(address, tracker)| ExitHealthEntry {
                address: *address,
                stats: tracker.stats(),
            })
            .collect();
        exits.sort_by_key(|e| e.address);
        HealthMonitorStats {
            rounds: self.rounds.load(Ordering::Relaxed),
            exits,
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("probe", &self.probe.name())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("recovery_threshold", &self.recovery_threshold)
            .finish_non_exhaustive()
    }
}
