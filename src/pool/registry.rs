//! Exit pool with lock-free snapshots
//!
//! Health and routability live in an immutable [`PoolSnapshot`] published
//! through `ArcSwap`. Counters live on the shared [`ExitIp`] values the
//! snapshots point at, so publishing a new snapshot never resets them.
//!
//! ```text
//! select()        -> ExitPool::snapshot() -> ArcSwap::load_full() -> PoolSnapshot
//!                                                 |
//!                                          (lock-free read)
//!
//! mark_healthy()  -> Mutex -> clone entries -> ArcSwap::store() -> old snapshot
//! set_routable()                                  |                dropped when
//!                                           (atomic swap)          readers finish
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::exit::ExitIp;
use super::lease::ConnectionGuard;
use super::stats::{now_ms, ExitStats, PoolStats};
use crate::config::ExitConfig;
use crate::error::PoolError;

/// One exit as seen by a snapshot
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub exit: Arc<ExitIp>,
    pub healthy: bool,
    /// Routing was provisioned (or steering is disabled)
    pub routable: bool,
}

impl PoolEntry {
    /// Healthy and routable
    #[inline]
    #[must_use]
    pub const fn is_selectable(&self) -> bool {
        self.healthy && self.routable
    }
}

/// Immutable, ordered view of the pool
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    entries: Vec<PoolEntry>,
    version: u64,
}

impl PoolSnapshot {
    /// Build a snapshot directly from entries
    #[must_use]
    pub fn new(entries: Vec<PoolEntry>) -> Self {
        Self {
            entries,
            version: 0,
        }
    }

    /// All entries in configuration order
    #[must_use]
    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    /// Monotonic version, bumped on every published change
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, address: IpAddr) -> Option<&PoolEntry> {
        self.entries.iter().find(|e| e.exit.address() == address)
    }

    /// Selectable exits in configuration order
    pub fn selectable(&self) -> impl Iterator<Item = &Arc<ExitIp>> + '_ {
        self.entries
            .iter()
            .filter(|e| e.is_selectable())
            .map(|e| &e.exit)
    }

    #[must_use]
    pub fn selectable_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_selectable()).count()
    }
}

/// The configured egress addresses
///
/// Owned by the application and shared by `Arc`; tests build isolated pools.
pub struct ExitPool {
    snapshot: ArcSwap<PoolSnapshot>,
    /// Serializes snapshot writers
    write_lock: Mutex<()>,
    /// Address -> entry index, fixed at construction
    index: HashMap<IpAddr, usize>,
}

impl ExitPool {
    /// Create a pool from exits; all start healthy and routable
    ///
    /// A repeated address keeps its first position.
    #[must_use]
    pub fn new(exits: Vec<ExitIp>) -> Self {
        let mut index = HashMap::with_capacity(exits.len());
        let mut entries = Vec::with_capacity(exits.len());
        for exit in exits {
            if index.contains_key(&exit.address()) {
                warn!(exit = %exit.address(), "Ignoring duplicate exit address");
                continue;
            }
            index.insert(exit.address(), entries.len());
            entries.push(PoolEntry {
                exit: Arc::new(exit),
                healthy: true,
                routable: true,
            });
        }

        Self {
            snapshot: ArcSwap::from_pointee(PoolSnapshot::new(entries)),
            write_lock: Mutex::new(()),
            index,
        }
    }

    /// Create a pool from configuration entries
    #[must_use]
    pub fn from_config(exits: &[ExitConfig]) -> Self {
        Self::new(exits.iter().map(ExitIp::from_config).collect())
    }

    /// Current consistent view; never blocks
    #[must_use]
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Number of configured exits
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All exits in configuration order
    #[must_use]
    pub fn exits(&self) -> Vec<Arc<ExitIp>> {
        self.snapshot
            .load()
            .entries()
            .iter()
            .map(|e| Arc::clone(&e.exit))
            .collect()
    }

    /// Shared state of one exit
    #[must_use]
    pub fn get(&self, address: IpAddr) -> Option<Arc<ExitIp>> {
        let idx = *self.index.get(&address)?;
        self.snapshot
            .load()
            .entries()
            .get(idx)
            .map(|e| Arc::clone(&e.exit))
    }

    fn exit(&self, address: IpAddr) -> Result<Arc<ExitIp>, PoolError> {
        self.get(address).ok_or(PoolError::UnknownExit(address))
    }

    /// Apply `f` to one entry and publish a new snapshot if it changed
    fn update<F>(&self, address: IpAddr, f: F) -> Result<bool, PoolError>
    where
        F: FnOnce(&mut PoolEntry),
    {
        let idx = *self
            .index
            .get(&address)
            .ok_or(PoolError::UnknownExit(address))?;

        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();
        let mut entries = current.entries.clone();
        let entry = &mut entries[idx];
        let before = (entry.healthy, entry.routable);
        f(entry);
        if before == (entry.healthy, entry.routable) {
            return Ok(false);
        }

        let version = current.version + 1;
        self.snapshot
            .store(Arc::new(PoolSnapshot { entries, version }));
        Ok(true)
    }

    /// Set an exit's health flag
    ///
    /// Returns whether the flag changed. An unroutable exit is never promoted.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownExit` if `address` is not configured.
    pub fn mark_healthy(&self, address: IpAddr, healthy: bool) -> Result<bool, PoolError> {
        let changed = self.update(address, |entry| {
            if healthy && !entry.routable {
                return;
            }
            entry.healthy = healthy;
        })?;
        if changed {
            debug!(exit = %address, healthy, "Exit health updated");
        }
        Ok(changed)
    }

    /// Include or exclude an exit at the routing layer
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownExit` if `address` is not configured.
    pub fn set_routable(&self, address: IpAddr, routable: bool) -> Result<bool, PoolError> {
        let changed = self.update(address, |entry| entry.routable = routable)?;
        if changed {
            debug!(exit = %address, routable, "Exit routability updated");
        }
        Ok(changed)
    }

    /// Count a connection on an exit without a guard
    ///
    /// Prefer [`ExitPool::on_connection_start`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownExit` if `address` is not configured.
    pub fn increment_active(&self, address: IpAddr) -> Result<(), PoolError> {
        self.exit(address)?.increment_active();
        Ok(())
    }

    /// Uncount a connection; saturates at zero
    ///
    /// Returns `false` (and logs) on an underflow attempt.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownExit` if `address` is not configured.
    pub fn decrement_active(&self, address: IpAddr) -> Result<bool, PoolError> {
        let decremented = self.exit(address)?.decrement_active();
        if !decremented {
            warn!(exit = %address, "Active connection counter underflow");
        }
        Ok(decremented)
    }

    /// `OnConnectionStart`: count the connection and hand back its guard
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownExit` if `address` is not configured.
    pub fn on_connection_start(&self, address: IpAddr) -> Result<ConnectionGuard, PoolError> {
        let exit = self.exit(address)?;
        exit.increment_active();
        Ok(ConnectionGuard::started(exit))
    }

    /// Stamp the exit's last health check time
    ///
    /// # Errors
    ///
    /// Returns `PoolError::UnknownExit` if `address` is not configured.
    pub fn record_health_check(&self, address: IpAddr) -> Result<(), PoolError> {
        self.exit(address)?.record_health_check();
        Ok(())
    }

    /// Point-in-time statistics for every exit
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let snapshot = self.snapshot();
        let exits = snapshot
            .entries()
            .iter()
            .map(|entry| {
                let exit = &entry.exit;
                let total = exit.total_connections();
                let active = exit.active_connections();
                let finished = total.saturating_sub(active);
                let avg_connection_ms = if finished == 0 {
                    0
                } else {
                    exit.total_duration().as_millis() as u64 / finished
                };
                ExitStats {
                    address: exit.address(),
                    interface: exit.interface().to_string(),
                    gateway: exit.gateway(),
                    table_id: exit.table_id(),
                    healthy: entry.healthy,
                    routable: entry.routable,
                    active_connections: active,
                    pending_dials: exit.pending_dials(),
                    total_connections: total,
                    failed_dials: exit.failed_dials(),
                    avg_connection_ms,
                    last_health_check_ms: exit.last_health_check_ms(),
                }
            })
            .collect();

        PoolStats {
            exits,
            version: snapshot.version(),
            timestamp_ms: now_ms(),
        }
    }
}

impl std::fmt::Debug for ExitPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("ExitPool")
            .field("exits", &snapshot.len())
            .field("selectable", &snapshot.selectable_count())
            .field("version", &snapshot.version())
            .finish()
    }
}
