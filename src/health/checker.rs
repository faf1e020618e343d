//! Per-exit health state machine
//!
//! # Health State Machine
//!
//! ```text
//! Healthy ──[1 failure]──> Unhealthy ──[recovery_threshold consecutive successes]──> Healthy
//!    ^                                                                  │
//!    └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Demotion is fail-fast so a broken exit stops receiving connections
//! within one probe interval. Promotion needs a run of successes so a
//! flapping exit does not bounce in and out of the selectable set.
//!
//! # Example
//!
//! ```
//! use exit_router::health::{ExitHealthTracker, HealthTransition};
//!
//! let tracker = ExitHealthTracker::new(3);
//! assert_eq!(tracker.record_failure(), HealthTransition::Demoted);
//! assert_eq!(tracker.record_success(), HealthTransition::Unchanged);
//! assert_eq!(tracker.record_success(), HealthTransition::Unchanged);
//! assert_eq!(tracker.record_success(), HealthTransition::Promoted);
//! assert!(tracker.is_healthy());
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

const STATE_HEALTHY: u8 = 0;
const STATE_UNHEALTHY: u8 = 1;

/// Default consecutive successes required to promote an exit
pub const DEFAULT_RECOVERY_THRESHOLD: u32 = 3;

/// Outcome of recording one probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Demoted,
    Promoted,
}

/// Health counters for one exit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitHealthStats {
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_successes: u32,
    pub is_healthy: bool,
    pub demotions: u64,
    pub promotions: u64,
}

/// Fail-fast, hysteresis-on-recovery health tracker
#[derive(Debug)]
pub struct ExitHealthTracker {
    state: AtomicU8,
    consecutive_successes: AtomicU32,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    demotions: AtomicU64,
    promotions: AtomicU64,
    recovery_threshold: u32,
    last_state_change: RwLock<Option<Instant>>,
}

impl ExitHealthTracker {
    /// Create a healthy tracker
    ///
    /// A threshold of 0 is treated as 1.
    #[must_use]
    pub fn new(recovery_threshold: u32) -> Self {
        Self {
            state: AtomicU8::new(STATE_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            recovery_threshold: recovery_threshold.max(1),
            last_state_change: RwLock::new(None),
        }
    }

    /// Create a tracker in the given state
    #[must_use]
    pub fn with_state(recovery_threshold: u32, healthy: bool) -> Self {
        let tracker = Self::new(recovery_threshold);
        if !healthy {
            tracker.state.store(STATE_UNHEALTHY, Ordering::Release);
        }
        tracker
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_HEALTHY
    }

    #[must_use]
    pub const fn recovery_threshold(&self) -> u32 {
        self.recovery_threshold
    }

    #[must_use]
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Record a successful probe
    pub fn record_success(&self) -> HealthTransition {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;

        if !self.is_healthy() && successes >= self.recovery_threshold {
            return self.transition(STATE_UNHEALTHY, STATE_HEALTHY);
        }
        HealthTransition::Unchanged
    }

    /// Record a failed probe; demotes immediately
    pub fn record_failure(&self) -> HealthTransition {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Release);

        if self.is_healthy() {
            return self.transition(STATE_HEALTHY, STATE_UNHEALTHY);
        }
        HealthTransition::Unchanged
    }

    /// Mark unhealthy without a probe, e.g. after external demotion
    pub fn force_unhealthy(&self) -> HealthTransition {
        self.consecutive_successes.store(0, Ordering::Release);
        if self.is_healthy() {
            return self.transition(STATE_HEALTHY, STATE_UNHEALTHY);
        }
        HealthTransition::Unchanged
    }

    /// Mark healthy without a probe, e.g. after external promotion
    ///
    /// Counts as a promotion, so the next failure demotes again.
    pub fn force_healthy(&self) -> HealthTransition {
        self.consecutive_successes.store(0, Ordering::Release);
        if !self.is_healthy() {
            return self.transition(STATE_UNHEALTHY, STATE_HEALTHY);
        }
        HealthTransition::Unchanged
    }

    /// Time since the last transition
    #[must_use]
    pub fn time_since_state_change(&self) -> Option<Duration> {
        self.last_state_change.read().map(|t| t.elapsed())
    }

    #[must_use]
    pub fn stats(&self) -> ExitHealthStats {
        ExitHealthStats {
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes(),
            is_healthy: self.is_healthy(),
            demotions: self.demotions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Private Methods
    // ========================================================================

    fn transition(&self, from: u8, to: u8) -> HealthTransition {
        // Concurrent recorders race here; only the CAS winner reports
        if self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return HealthTransition::Unchanged;
        }
        *self.last_state_change.write() = Some(Instant::now());

        if to == STATE_HEALTHY {
            self.promotions.fetch_add(1, Ordering::Relaxed);
            HealthTransition::Promoted
        } else {
            self.demotions.fetch_add(1, Ordering::Relaxed);
            HealthTransition::Demoted
        }
    }
}

impl Default for ExitHealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERY_THRESHOLD)
    }
}
