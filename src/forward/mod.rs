//! Static TCP forwards
//!
//! The simplest tunnel handler: every client accepted on a forward's listen
//! address is relayed to that forward's fixed target through
//! [`ExitDialer`](crate::dialer::ExitDialer). No protocol is spoken; bytes
//! are copied both ways until either side closes.

mod listener;

pub use listener::{ForwardListener, ForwardStats};
