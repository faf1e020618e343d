//! Pool statistics
//!
//! Point-in-time views of the exit pool, serializable for logs and
//! external inspection.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Snapshot of one exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStats {
    pub address: IpAddr,
    pub interface: String,
    pub gateway: IpAddr,
    /// Routing table id (also the fwmark); `None` while unprovisioned
    pub table_id: Option<u32>,
    pub healthy: bool,
    /// False when routing could not be provisioned for this exit
    pub routable: bool,
    pub active_connections: u64,
    pub pending_dials: u64,
    pub total_connections: u64,
    pub failed_dials: u64,
    /// Mean duration of finished connections
    pub avg_connection_ms: u64,
    /// Unix milliseconds of the last completed probe
    pub last_health_check_ms: Option<u64>,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Exits in configuration order
    pub exits: Vec<ExitStats>,
    /// Snapshot version the stats were taken from
    pub version: u64,
    pub timestamp_ms: u64,
}

impl PoolStats {
    /// Number of exits that are healthy and routable
    #[must_use]
    pub fn selectable(&self) -> usize {
        self.exits.iter().filter(|e| e.healthy && e.routable).count()
    }

    /// Sum of active connections across all exits
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.exits.iter().map(|e| e.active_connections).sum()
    }

    /// Sum of total connections across all exits
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.exits.iter().map(|e| e.total_connections).sum()
    }

    /// Look up one exit
    #[must_use]
    pub fn exit(&self, address: IpAddr) -> Option<&ExitStats> {
        self.exits.iter().find(|e| e.address == address)
    }
}
