//! Exit selection strategies
//!
//! An [`IpSelector`] maps a [`SelectionKey`] to one selectable exit of a
//! [`PoolSnapshot`]. It reads the snapshot and the exits' load counters but
//! never mutates either; claiming the chosen exit is the dialer's job.
//!
//! # Strategies
//!
//! | Strategy | Description |
//! |----------|-------------|
//! | `RoundRobin` | Shared counter modulo the healthy set size (DEFAULT) |
//! | `DestinationBased` | Hash of sticky key or host over the address-sorted healthy set |
//! | `LeastConnections` | Minimum active + pending load, ties by pool order |
//! | `PortBased` | Static port range table, round-robin fallback |
//!
//! # Stickiness
//!
//! `DestinationBased` is plain modulo hashing, not consistent hashing. Any
//! change to the healthy set (a demotion, a promotion) remaps most
//! destinations. Hashes use `DefaultHasher` and are only guaranteed stable
//! within one build of the binary.
//!
//! # Example
//!
//! ```
//! use exit_router::config::{ExitConfig, SelectorStrategy};
//! use exit_router::pool::ExitPool;
//! use exit_router::selector::{IpSelector, SelectionKey};
//!
//! let pool = ExitPool::from_config(&[
//!     ExitConfig::new("10.0.0.1".parse().unwrap(), "eth0", "10.0.0.254".parse().unwrap()),
//!     ExitConfig::new("10.0.0.2".parse().unwrap(), "eth0", "10.0.0.254".parse().unwrap()),
//! ]);
//! let selector = IpSelector::new(SelectorStrategy::DestinationBased);
//! let key = SelectionKey::new("example.com", 443);
//!
//! let first = selector.select(&pool.snapshot(), &key).unwrap();
//! let second = selector.select(&pool.snapshot(), &key).unwrap();
//! assert_eq!(first.address(), second.address());
//! ```

mod port_map;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use crate::config::SelectorStrategy;
use crate::config::SelectorConfig;
use crate::error::SelectError;
use crate::pool::{load_of, ExitIp, PoolSnapshot};

pub use port_map::{PortMap, PortRange};

/// What a session wants to reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionKey {
    pub target_host: String,
    pub target_port: u16,
    /// Overrides the host for destination-based stickiness
    pub sticky_key: Option<String>,
}

impl SelectionKey {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            sticky_key: None,
        }
    }

    #[must_use]
    pub fn with_sticky_key(mut self, key: impl Into<String>) -> Self {
        self.sticky_key = Some(key.into());
        self
    }

    /// Hash of the sticky key, or of the lowercased host
    #[must_use]
    pub fn affinity_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match &self.sticky_key {
            Some(key) => key.hash(&mut hasher),
            None => self.target_host.to_ascii_lowercase().hash(&mut hasher),
        }
        hasher.finish()
    }
}

/// The chosen exit
#[derive(Debug, Clone)]
pub struct Selection {
    pub exit: Arc<ExitIp>,
    /// Load word read during a least-connections scan, for a CAS claim
    pub observed_load: Option<u64>,
}

impl Selection {
    #[must_use]
    pub fn address(&self) -> IpAddr {
        self.exit.address()
    }
}

/// Selection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorStats {
    pub selections: u64,
    /// Port-based lookups whose mapped exit was unavailable
    pub port_fallbacks: u64,
    pub no_healthy_exit: u64,
}

/// Strategy plus the little state it needs
pub struct IpSelector {
    strategy: SelectorStrategy,
    rr_counter: AtomicUsize,
    port_map: PortMap,
    selections: AtomicU64,
    port_fallbacks: AtomicU64,
    no_healthy_exit: AtomicU64,
}

impl IpSelector {
    #[must_use]
    pub fn new(strategy: SelectorStrategy) -> Self {
        Self::with_port_map(strategy, PortMap::default())
    }

    #[must_use]
    pub fn with_port_map(strategy: SelectorStrategy, port_map: PortMap) -> Self {
        Self {
            strategy,
            rr_counter: AtomicUsize::new(0),
            port_map,
            selections: AtomicU64::new(0),
            port_fallbacks: AtomicU64::new(0),
            no_healthy_exit: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::with_port_map(config.strategy, PortMap::from_config(&config.port_ranges))
    }

    #[must_use]
    pub const fn strategy(&self) -> SelectorStrategy {
        self.strategy
    }

    /// Pick one selectable exit
    ///
    /// # Errors
    ///
    /// Returns `SelectError::NoHealthyExit` if no exit is healthy and routable.
    pub fn select(
        &self,
        snapshot: &PoolSnapshot,
        key: &SelectionKey,
    ) -> Result<Selection, SelectError> {
        self.select_excluding(snapshot, key, &[])
    }

    /// Pick one selectable exit not in `excluded`
    ///
    /// # Errors
    ///
    /// Returns `SelectError::NoHealthyExit` if the filtered set is empty.
    pub fn select_excluding(
        &self,
        snapshot: &PoolSnapshot,
        key: &SelectionKey,
        excluded: &[IpAddr],
    ) -> Result<Selection, SelectError> {
        let candidates: Vec<&Arc<ExitIp>> = snapshot
            .selectable()
            .filter(|exit| !excluded.contains(&exit.address()))
            .collect();

        if candidates.is_empty() {
            self.no_healthy_exit.fetch_add(1, Ordering::Relaxed);
            debug!(
                host = %key.target_host,
                port = key.target_port,
                excluded = excluded.len(),
                "No healthy exit available"
            );
            return Err(SelectError::NoHealthyExit);
        }

        let selection = match self.strategy {
            SelectorStrategy::RoundRobin => self.round_robin(&candidates),
            SelectorStrategy::DestinationBased => Self::destination_based(&candidates, key),
            SelectorStrategy::LeastConnections => Self::least_connections(&candidates),
            SelectorStrategy::PortBased => self.port_based(&candidates, key),
        };

        self.selections.fetch_add(1, Ordering::Relaxed);
        trace!(
            strategy = %self.strategy,
            host = %key.target_host,
            port = key.target_port,
            exit = %selection.address(),
            "Exit selected"
        );
        Ok(selection)
    }

    fn round_robin(&self, candidates: &[&Arc<ExitIp>]) -> Selection {
        let index = self.rr_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Selection {
            exit: Arc::clone(candidates[index]),
            observed_load: None,
        }
    }

    fn destination_based(candidates: &[&Arc<ExitIp>], key: &SelectionKey) -> Selection {
        let mut sorted: Vec<&Arc<ExitIp>> = candidates.to_vec();
        sorted.sort_by_key(|exit| exit.address());
        let index = (key.affinity_hash() % sorted.len() as u64) as usize;
        Selection {
            exit: Arc::clone(sorted[index]),
            observed_load: None,
        }
    }

    fn least_connections(candidates: &[&Arc<ExitIp>]) -> Selection {
        // min_by_key keeps the first minimum, so ties go to pool order
        let (exit, word) = candidates
            .iter()
            .map(|exit| (*exit, exit.load_word()))
            .min_by_key(|(_, word)| load_of(*word))
            .map(|(exit, word)| (Arc::clone(exit), word))
            .unwrap_or_else(|| (Arc::clone(candidates[0]), candidates[0].load_word()));
        Selection {
            exit,
            observed_load: Some(word),
        }
    }

    fn port_based(&self, candidates: &[&Arc<ExitIp>], key: &SelectionKey) -> Selection {
        let Some(mapped) = self.port_map.lookup(key.target_port) else {
            return self.round_robin(candidates);
        };

        if let Some(exit) = candidates.iter().find(|exit| exit.address() == mapped) {
            return Selection {
                exit: Arc::clone(*exit),
                observed_load: None,
            };
        }

        self.port_fallbacks.fetch_add(1, Ordering::Relaxed);
        debug!(
            port = key.target_port,
            mapped = %mapped,
            "Mapped exit unavailable, falling back to round-robin"
        );
        self.round_robin(candidates)
    }

    #[must_use]
    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            selections: self.selections.load(Ordering::Relaxed),
            port_fallbacks: self.port_fallbacks.load(Ordering::Relaxed),
            no_healthy_exit: self.no_healthy_exit.load(Ordering::Relaxed),
        }
    }

    /// Reset the round-robin counter
    pub fn reset(&self) {
        self.rr_counter.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for IpSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpSelector")
            .field("strategy", &self.strategy)
            .field("port_ranges", &self.port_map.len())
            .finish()
    }
}
