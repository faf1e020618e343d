//! Exit health
//!
//! - [`ExitHealthTracker`]: fail-fast / hysteresis state machine per exit
//! - [`ExitProbe`]: pluggable reachability check ([`TcpConnectProbe`] by default)
//! - [`HealthMonitor`]: background loop applying probe results to the pool

mod checker;
mod monitor;
mod probe;

pub use checker::{
    ExitHealthStats, ExitHealthTracker, HealthTransition, DEFAULT_RECOVERY_THRESHOLD,
};
pub use monitor::{CheckReport, ExitHealthEntry, HealthMonitor, HealthMonitorStats};
pub use probe::{ExitProbe, TcpConnectProbe};
