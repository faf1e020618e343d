//! Outbound dialing through exits
//!
//! [`ExitDialer`] is the entry point tunnel handlers use: it turns a
//! destination into a [`SteeredConnection`] whose packets leave through one
//! exit and whose lifetime is counted against that exit.

mod connection;
mod exit_dialer;
mod socket;

pub use connection::SteeredConnection;
pub use exit_dialer::{DialerStats, ExitDialer};
pub use socket::{ConnectionBinding, OutboundSocket};
