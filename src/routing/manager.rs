//! Routing manager: owns kernel routing state for all exits
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --setup()--> Ready --cleanup()--> Uninitialized
//!                              |  \
//!                              |   setup() again: provisions only exits
//!                              |   that are not provisioned yet
//!                              v
//!                    mark_connection(socket, exit)
//! ```
//!
//! Every artifact that `setup()` creates is appended to a creation ledger.
//! `cleanup()` walks that ledger in reverse, so teardown does not depend on
//! the current health or routability of any exit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::allocator::{TableAllocator, TableAllocatorError};
use super::backend::{RoutingBackend, RoutingRule, INSTALL_ORDER};
use crate::config::RoutingConfig;
use crate::dialer::{ConnectionBinding, OutboundSocket};
use crate::error::{ArtifactKind, BindError, ExitFailure, RoutingError};
use crate::pool::{ExitIp, ExitPool};

/// Manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingState {
    Uninitialized,
    Ready,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    kind: ArtifactKind,
    rule: RoutingRule,
}

struct Provisioned {
    rule: RoutingRule,
    exit: Arc<ExitIp>,
}

struct Inner {
    state: RoutingState,
    provisioned: HashMap<IpAddr, Provisioned>,
    ledger: Vec<LedgerEntry>,
}

/// Setup/cleanup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RoutingStats {
    pub provisioned_exits: usize,
    pub artifacts: usize,
    pub tables_allocated: u32,
}

/// Drives a [`RoutingBackend`] through the exit lifecycle
pub struct RoutingManager {
    backend: Arc<dyn RoutingBackend>,
    enabled: bool,
    priority: u32,
    allocator: TableAllocator,
    inner: RwLock<Inner>,
}

impl RoutingManager {
    /// Create a manager
    ///
    /// # Errors
    ///
    /// Returns `TableAllocatorError::Reserved` if `config.table_base <= 255`.
    pub fn new(
        config: &RoutingConfig,
        backend: Arc<dyn RoutingBackend>,
    ) -> Result<Self, TableAllocatorError> {
        Ok(Self {
            backend,
            enabled: config.enabled,
            priority: config.rule_priority,
            allocator: TableAllocator::new(config.table_base)?,
            inner: RwLock::new(Inner {
                state: RoutingState::Uninitialized,
                provisioned: HashMap::new(),
                ledger: Vec::new(),
            }),
        })
    }

    /// Whether kernel steering is enabled
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn state(&self) -> RoutingState {
        self.inner.read().state
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == RoutingState::Ready
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Rule provisioned for `exit`, if any
    #[must_use]
    pub fn rule_for(&self, exit: IpAddr) -> Option<RoutingRule> {
        self.inner
            .read()
            .provisioned
            .get(&exit)
            .map(|p| p.rule.clone())
    }

    #[must_use]
    pub fn stats(&self) -> RoutingStats {
        let inner = self.inner.read();
        RoutingStats {
            provisioned_exits: inner.provisioned.len(),
            artifacts: inner.ledger.len(),
            tables_allocated: self.allocator.allocated(),
        }
    }

    /// Provision every exit of `pool` that is not provisioned yet
    ///
    /// A failure on one exit rolls back that exit's partial artifacts, marks
    /// it unhealthy and unroutable, and provisioning continues with the next.
    /// A later successful attempt restores routability only.
    /// Calling this again without `cleanup()` creates no duplicates.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::SetupPartialFailure` listing every exit that
    /// could not be provisioned. The manager is Ready either way.
    pub fn setup(&self, pool: &ExitPool) -> Result<(), RoutingError> {
        let mut inner = self.inner.write();

        if !self.enabled {
            inner.state = RoutingState::Ready;
            info!("Kernel steering disabled, routing manager is a no-op");
            return Ok(());
        }

        let mut failures = Vec::new();
        for exit in pool.exits() {
            let address = exit.address();
            if inner.provisioned.contains_key(&address) {
                debug!(exit = %address, "Exit already provisioned");
                continue;
            }

            match self.provision(&exit, &mut inner.ledger) {
                Ok(rule) => {
                    exit.set_table_id(Some(rule.table_id));
                    // Re-admitted exits stay unhealthy until the health monitor promotes them
                    let _ = pool.set_routable(address, true);
                    info!(
                        exit = %address,
                        table = rule.table_id,
                        backend = self.backend.name(),
                        "Exit provisioned"
                    );
                    inner.provisioned.insert(
                        address,
                        Provisioned {
                            rule,
                            exit: Arc::clone(&exit),
                        },
                    );
                }
                Err(failure) => {
                    warn!(
                        exit = %address,
                        artifact = ?failure.artifact,
                        reason = %failure.reason,
                        "Failed to provision exit, excluding it"
                    );
                    exit.set_table_id(None);
                    let _ = pool.mark_healthy(address, false);
                    let _ = pool.set_routable(address, false);
                    failures.push(failure);
                }
            }
        }

        inner.state = RoutingState::Ready;
        info!(
            provisioned = inner.provisioned.len(),
            failed = failures.len(),
            artifacts = inner.ledger.len(),
            "Routing setup complete"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RoutingError::SetupPartialFailure { failures })
        }
    }

    /// Install route, policy rule and SNAT for one exit
    ///
    /// On failure the artifacts installed so far are removed again; any that
    /// cannot be removed stay in the ledger for `cleanup()`.
    fn provision(
        &self,
        exit: &ExitIp,
        ledger: &mut Vec<LedgerEntry>,
    ) -> Result<RoutingRule, ExitFailure> {
        let table_id = self.allocator.allocate().map_err(|e| ExitFailure {
            exit: exit.address(),
            artifact: None,
            reason: e.to_string(),
        })?;
        let rule = RoutingRule::for_exit(exit, table_id, self.priority);

        let mut installed: Vec<ArtifactKind> = Vec::with_capacity(INSTALL_ORDER.len());
        for kind in INSTALL_ORDER {
            if let Err(e) = self.backend.install(kind, &rule) {
                for done in installed.into_iter().rev() {
                    if let Err(re) = self.backend.remove(done, &rule) {
                        warn!(
                            exit = %rule.address,
                            artifact = %done,
                            error = %re,
                            "Rollback failed, leaving artifact for cleanup"
                        );
                        ledger.push(LedgerEntry {
                            kind: done,
                            rule: rule.clone(),
                        });
                    }
                }
                return Err(ExitFailure {
                    exit: exit.address(),
                    artifact: Some(kind),
                    reason: e.to_string(),
                });
            }
            installed.push(kind);
        }

        ledger.extend(installed.into_iter().map(|kind| LedgerEntry {
            kind,
            rule: rule.clone(),
        }));
        Ok(rule)
    }

    /// Mark an unconnected socket so it egresses through `exit`
    ///
    /// Must be called before connect. With steering disabled this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `BindError` when the manager is not Ready, the exit is not
    /// provisioned, the socket is already bound, or the platform call fails.
    pub fn mark_connection(
        &self,
        socket: &mut OutboundSocket,
        exit: &ExitIp,
    ) -> Result<(), BindError> {
        if !self.enabled {
            return Ok(());
        }

        if let Some(binding) = socket.binding() {
            return Err(BindError::AlreadyBound(binding.exit));
        }

        let inner = self.inner.read();
        if inner.state != RoutingState::Ready {
            return Err(BindError::NotReady);
        }

        let address = exit.address();
        let provisioned = inner
            .provisioned
            .get(&address)
            .ok_or(BindError::NotProvisioned(address))?;

        self.backend
            .mark_socket(socket.socket(), &provisioned.rule)
            .map_err(|source| BindError::Backend {
                exit: address,
                source,
            })?;

        socket.set_binding(ConnectionBinding {
            exit: address,
            fwmark: provisioned.rule.fwmark,
        });
        Ok(())
    }

    /// Remove every artifact created by `setup()`, newest first
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::CleanupIncomplete` listing artifacts that could
    /// not be removed. They stay in the ledger, so calling `cleanup()` again
    /// retries them.
    pub fn cleanup(&self) -> Result<(), RoutingError> {
        let mut inner = self.inner.write();

        if !self.enabled {
            inner.state = RoutingState::Uninitialized;
            return Ok(());
        }

        let ledger = std::mem::take(&mut inner.ledger);
        let total = ledger.len();
        let mut leftovers = Vec::new();
        let mut remaining = Vec::new();

        for entry in ledger.into_iter().rev() {
            match self.backend.remove(entry.kind, &entry.rule) {
                Ok(()) => {
                    debug!(exit = %entry.rule.address, artifact = %entry.kind, "Artifact removed");
                }
                Err(e) => {
                    warn!(
                        exit = %entry.rule.address,
                        artifact = %entry.kind,
                        error = %e,
                        "Failed to remove artifact"
                    );
                    leftovers.push(ExitFailure {
                        exit: entry.rule.address,
                        artifact: Some(entry.kind),
                        reason: e.to_string(),
                    });
                    remaining.push(entry);
                }
            }
        }

        // Keep creation order for the next attempt
        remaining.reverse();
        inner.ledger = remaining;

        for (_, provisioned) in inner.provisioned.drain() {
            provisioned.exit.set_table_id(None);
        }
        inner.state = RoutingState::Uninitialized;

        info!(
            removed = total - leftovers.len(),
            leftover = leftovers.len(),
            "Routing cleanup complete"
        );

        if leftovers.is_empty() {
            Ok(())
        } else {
            Err(RoutingError::CleanupIncomplete { leftovers })
        }
    }
}

impl std::fmt::Debug for RoutingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingManager")
            .field("backend", &self.backend.name())
            .field("enabled", &self.enabled)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExitConfig;
    use crate::routing::MemoryBackend;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn pool() -> ExitPool {
        ExitPool::from_config(&[
            ExitConfig::new(ip("10.0.0.1"), "eth0", ip("10.0.0.254")),
            ExitConfig::new(ip("10.0.0.2"), "eth0", ip("10.0.0.254")),
            ExitConfig::new(ip("10.0.0.3"), "eth1", ip("10.0.0.254")),
        ])
    }

    fn manager(backend: &Arc<MemoryBackend>) -> RoutingManager {
        RoutingManager::new(&RoutingConfig::default(), Arc::clone(backend) as Arc<dyn RoutingBackend>)
            .unwrap()
    }

    fn socket() -> OutboundSocket {
        OutboundSocket::tcp_for("127.0.0.1:80".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_setup_provisions_every_exit() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager(&backend);
        let pool = pool();

        assert_eq!(manager.state(), RoutingState::Uninitialized);
        manager.setup(&pool).unwrap();
        assert!(manager.is_ready());
        assert_eq!(backend.installed_count(), 9);

        let tables: Vec<_> = pool.exits().iter().map(|e| e.table_id()).collect();
        assert_eq!(tables, vec![Some(1000), Some(1001), Some(1002)]);
        assert_eq!(manager.rule_for(ip("10.0.0.2")).unwrap().fwmark, 1001);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager(&backend);
        let pool = pool();

        manager.setup(&pool).unwrap();
        manager.setup(&pool).unwrap();
        assert_eq!(backend.installed_count(), 9);
        assert_eq!(backend.created(), 9);
        assert_eq!(manager.stats().tables_allocated, 3);
    }

    #[test]
    fn test_partial_failure_rolls_back_and_excludes() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_install(ip("10.0.0.2"), ArtifactKind::Snat);
        let manager = manager(&backend);
        let pool = pool();

        let err = manager.setup(&pool).unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].exit, ip("10.0.0.2"));
        assert_eq!(failures[0].artifact, Some(ArtifactKind::Snat));

        // Route and policy rule of the failed exit were rolled back
        assert!(backend.installed_for(ip("10.0.0.2")).is_empty());
        assert_eq!(backend.installed_count(), 6);

        let snap = pool.snapshot();
        let entry = snap.get(ip("10.0.0.2")).unwrap();
        assert!(!entry.healthy);
        assert!(!entry.routable);
        assert_eq!(entry.exit.table_id(), None);
        assert!(manager.is_ready());
    }

    #[test]
    fn test_failed_table_id_not_reused() {
        let backend = Arc::new(MemoryBackend::new());
        backend.remove_interface("eth1");
        let manager = manager(&backend);
        let pool = pool();

        assert!(manager.setup(&pool).is_err());
        backend.clear_failures();
        manager.setup(&pool).unwrap();

        // 1002 was burnt by the failed attempt
        let exit = pool.get(ip("10.0.0.3")).unwrap();
        assert_eq!(exit.table_id(), Some(1003));
        assert!(pool.snapshot().get(ip("10.0.0.3")).unwrap().routable);
    }

    #[test]
    fn test_retry_restores_routable_but_not_healthy() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_install(ip("10.0.0.2"), ArtifactKind::PolicyRule);
        let manager = manager(&backend);
        let pool = pool();

        assert!(manager.setup(&pool).is_err());
        backend.clear_failures();
        manager.setup(&pool).unwrap();

        let snap = pool.snapshot();
        let entry = snap.get(ip("10.0.0.2")).unwrap();
        assert!(entry.routable);
        assert!(!entry.healthy);
        assert_eq!(snap.selectable_count(), 2);
    }

    #[test]
    fn test_mark_connection() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager(&backend);
        let pool = pool();
        let exit = pool.get(ip("10.0.0.1")).unwrap();

        let mut s = socket();
        assert!(matches!(
            manager.mark_connection(&mut s, &exit),
            Err(BindError::NotReady)
        ));

        manager.setup(&pool).unwrap();
        manager.mark_connection(&mut s, &exit).unwrap();
        assert_eq!(s.binding().unwrap().fwmark, 1000);
        assert_eq!(backend.mark_of(s.socket()), Some(1000));

        // Second bind on the same handle
        let other = pool.get(ip("10.0.0.2")).unwrap();
        assert!(matches!(
            manager.mark_connection(&mut s, &other),
            Err(BindError::AlreadyBound(addr)) if addr == ip("10.0.0.1")
        ));
        assert_eq!(backend.marks_applied(), 1);
    }

    #[test]
    fn test_mark_connection_unprovisioned_and_platform_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_install(ip("10.0.0.3"), ArtifactKind::Route);
        backend.fail_mark(ip("10.0.0.2"));
        let manager = manager(&backend);
        let pool = pool();
        let _ = manager.setup(&pool);

        let mut s = socket();
        let exit3 = pool.get(ip("10.0.0.3")).unwrap();
        assert!(matches!(
            manager.mark_connection(&mut s, &exit3),
            Err(BindError::NotProvisioned(_))
        ));

        let exit2 = pool.get(ip("10.0.0.2")).unwrap();
        assert!(matches!(
            manager.mark_connection(&mut s, &exit2),
            Err(BindError::Backend { .. })
        ));
        assert!(s.binding().is_none());
    }

    #[test]
    fn test_cleanup_removes_everything_after_health_change() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager(&backend);
        let pool = pool();

        manager.setup(&pool).unwrap();
        pool.mark_healthy(ip("10.0.0.1"), false).unwrap();
        pool.set_routable(ip("10.0.0.2"), false).unwrap();

        manager.cleanup().unwrap();
        assert_eq!(backend.installed_count(), 0);
        assert_eq!(backend.removed(), 9);
        assert_eq!(manager.state(), RoutingState::Uninitialized);
        assert!(pool.exits().iter().all(|e| e.table_id().is_none()));
    }

    #[test]
    fn test_cleanup_incomplete_is_retryable() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = manager(&backend);
        let pool = pool();
        manager.setup(&pool).unwrap();

        backend.fail_remove(ip("10.0.0.3"), ArtifactKind::PolicyRule);
        let err = manager.cleanup().unwrap_err();
        assert!(matches!(err, RoutingError::CleanupIncomplete { .. }));
        assert_eq!(err.failures().len(), 1);
        assert_eq!(backend.installed_count(), 1);

        backend.clear_failures();
        manager.cleanup().unwrap();
        assert_eq!(backend.installed_count(), 0);
    }

    #[test]
    fn test_disabled_manager_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let config = RoutingConfig {
            enabled: false,
            ..RoutingConfig::default()
        };
        let manager =
            RoutingManager::new(&config, Arc::clone(&backend) as Arc<dyn RoutingBackend>).unwrap();
        let pool = pool();

        manager.setup(&pool).unwrap();
        let mut s = socket();
        manager
            .mark_connection(&mut s, &pool.get(ip("10.0.0.1")).unwrap())
            .unwrap();
        manager.cleanup().unwrap();

        assert_eq!(backend.created(), 0);
        assert_eq!(backend.marks_applied(), 0);
        assert_eq!(pool.snapshot().selectable_count(), 3);
    }
}
