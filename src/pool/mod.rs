//! Exit-IP pool
//!
//! The pool owns the configured egress addresses, their health and
//! routability flags, and their connection counters.
//!
//! - [`ExitPool`]: owner object, shared by `Arc`
//! - [`PoolSnapshot`]: consistent, lock-free view used for one selection
//! - [`Reservation`] / [`ConnectionGuard`]: RAII counter handles
//! - [`PoolStats`]: serializable point-in-time statistics

mod exit;
mod lease;
mod registry;
mod stats;

pub use exit::{load_of, ExitIp};
pub use lease::{ConnectionGuard, Reservation};
pub use registry::{ExitPool, PoolEntry, PoolSnapshot};
pub use stats::{ExitStats, PoolStats};

pub(crate) use stats::now_ms;
