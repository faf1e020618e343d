//! Per-exit state shared by the pool, the selector and the dialer
//!
//! Identity fields (address, interface, gateway) are immutable. Everything
//! else is atomic so lifecycle hooks on many tasks can update it without
//! taking a lock.
//!
//! # Load word
//!
//! Active connections and in-flight dial reservations are packed into one
//! `AtomicU64`:
//!
//! ```text
//! 63            32 31             0
//! +---------------+---------------+
//! |    active     |    pending    |
//! +---------------+---------------+
//! ```
//!
//! Packing both lets least-connections claim an exit with a single
//! compare-and-swap against the exact load it observed.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::config::ExitConfig;

use super::stats::now_ms;

const PENDING_MASK: u64 = 0xFFFF_FFFF;
const ACTIVE_ONE: u64 = 1 << 32;

/// Table id value meaning "not provisioned"
const NO_TABLE: u32 = 0;

#[inline]
const fn active_of(word: u64) -> u64 {
    word >> 32
}

#[inline]
const fn pending_of(word: u64) -> u64 {
    word & PENDING_MASK
}

/// Combined load (active + pending) of a packed load word
#[inline]
#[must_use]
pub const fn load_of(word: u64) -> u64 {
    active_of(word) + pending_of(word)
}

/// One egress address and its counters
#[derive(Debug)]
pub struct ExitIp {
    address: IpAddr,
    interface: String,
    gateway: IpAddr,
    table_id: AtomicU32,
    load: AtomicU64,
    total_connections: AtomicU64,
    total_duration_ms: AtomicU64,
    failed_dials: AtomicU64,
    last_health_check_ms: AtomicU64,
}

impl ExitIp {
    /// Create a new, unprovisioned exit
    pub fn new(address: IpAddr, interface: impl Into<String>, gateway: IpAddr) -> Self {
        Self {
            address,
            interface: interface.into(),
            gateway,
            table_id: AtomicU32::new(NO_TABLE),
            load: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            failed_dials: AtomicU64::new(0),
            last_health_check_ms: AtomicU64::new(0),
        }
    }

    /// Create an exit from its configuration entry
    #[must_use]
    pub fn from_config(config: &ExitConfig) -> Self {
        Self::new(config.address, config.interface.clone(), config.gateway)
    }

    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[must_use]
    pub const fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Routing table id (equal to the fwmark), `None` while unprovisioned
    #[must_use]
    pub fn table_id(&self) -> Option<u32> {
        match self.table_id.load(Ordering::Acquire) {
            NO_TABLE => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_table_id(&self, table_id: Option<u32>) {
        self.table_id
            .store(table_id.unwrap_or(NO_TABLE), Ordering::Release);
    }

    /// Raw packed load word, see the module docs
    #[must_use]
    pub fn load_word(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    /// Active plus pending
    #[must_use]
    pub fn load(&self) -> u64 {
        load_of(self.load_word())
    }

    /// Connections that completed target-dial and have not ended
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        active_of(self.load_word())
    }

    /// Dials that reserved this exit but have not connected yet
    #[must_use]
    pub fn pending_dials(&self) -> u64 {
        pending_of(self.load_word())
    }

    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_dials(&self) -> u64 {
        self.failed_dials.load(Ordering::Relaxed)
    }

    /// Summed duration of finished connections
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_duration_ms.load(Ordering::Relaxed))
    }

    /// Unix milliseconds of the last completed probe
    #[must_use]
    pub fn last_health_check_ms(&self) -> Option<u64> {
        match self.last_health_check_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Reserve a dial slot only if the load word still equals `observed`
    ///
    /// Returns `false` when another task changed the load in between.
    pub(crate) fn try_reserve(&self, observed: u64) -> bool {
        self.load
            .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reserve a dial slot unconditionally
    pub(crate) fn reserve(&self) {
        self.load.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_reservation(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (pending_of(word) > 0).then(|| word - 1)
            });
    }

    /// Turn one pending reservation into an active connection in one step
    pub(crate) fn commit_reservation(&self) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                if pending_of(word) > 0 {
                    Some(word - 1 + ACTIVE_ONE)
                } else {
                    Some(word + ACTIVE_ONE)
                }
            });
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_active(&self) {
        self.load.fetch_add(ACTIVE_ONE, Ordering::AcqRel);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    ///
    /// Returns `false` if the counter was already zero.
    pub(crate) fn decrement_active(&self) -> bool {
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (active_of(word) > 0).then(|| word - ACTIVE_ONE)
            })
            .is_ok()
    }

    pub(crate) fn record_connection_duration(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_dial(&self) {
        self.failed_dials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_health_check(&self) {
        self.last_health_check_ms.store(now_ms(), Ordering::Relaxed);
    }
}
