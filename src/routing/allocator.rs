//! Routing table id allocator
//!
//! Each provisioned exit gets its own routing table. The table id doubles as
//! the fwmark that selects it, so one number identifies the exit in both
//! `ip rule` and `SO_MARK`.
//!
//! # Allocation policy
//!
//! Ids are handed out from a monotonic counter starting at the configured
//! base and are never recycled for the lifetime of the process, not even
//! after `cleanup()` or a failed provisioning attempt. An in-flight
//! connection still carrying an old mark can therefore never be routed
//! through a table that was since reassigned to a different exit.
//!
//! Ids at or below 255 are rejected: 253 (default), 254 (main) and
//! 255 (local) belong to the kernel.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::RESERVED_TABLE_MAX;

/// Error types for table id allocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableAllocatorError {
    /// The counter reached `u32::MAX`
    #[error("No available routing table ids")]
    Exhausted,

    /// The base overlaps kernel-reserved tables
    #[error("Routing table base {0} overlaps reserved tables (must be > 255)")]
    Reserved(u32),
}

/// Monotonic table id allocator
#[derive(Debug)]
pub struct TableAllocator {
    base: u32,
    next: AtomicU32,
}

impl TableAllocator {
    /// Create an allocator starting at `base`
    ///
    /// # Errors
    ///
    /// Returns `TableAllocatorError::Reserved` if `base <= 255`.
    pub fn new(base: u32) -> Result<Self, TableAllocatorError> {
        if base <= RESERVED_TABLE_MAX {
            return Err(TableAllocatorError::Reserved(base));
        }
        Ok(Self {
            base,
            next: AtomicU32::new(base),
        })
    }

    /// First id this allocator hands out
    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Allocate the next id
    ///
    /// # Errors
    ///
    /// Returns `TableAllocatorError::Exhausted` once the counter reaches `u32::MAX`.
    pub fn allocate(&self) -> Result<u32, TableAllocatorError> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map_err(|_| TableAllocatorError::Exhausted)
    }

    /// Number of ids handed out so far
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.next.load(Ordering::Acquire) - self.base
    }
}
