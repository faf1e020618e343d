//! RAII handles for the exit load counters
//!
//! A [`Reservation`] counts a dial that is still in flight. A
//! [`ConnectionGuard`] counts an established connection. Both undo their
//! effect exactly once, either explicitly or on drop, so a cancelled dial
//! future or a panicking relay task cannot leak load.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::exit::ExitIp;

/// Pending dial slot on an exit
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    exit: Arc<ExitIp>,
    done: bool,
}

impl Reservation {
    /// Claim a slot only if the exit's load word still equals `observed`
    ///
    /// Returns `None` when another task changed the load first.
    pub fn claim(exit: &Arc<ExitIp>, observed: u64) -> Option<Self> {
        exit.try_reserve(observed).then(|| Self {
            exit: Arc::clone(exit),
            done: false,
        })
    }

    /// Claim a slot unconditionally
    pub fn acquire(exit: &Arc<ExitIp>) -> Self {
        exit.reserve();
        Self {
            exit: Arc::clone(exit),
            done: false,
        }
    }

    /// The reserved exit
    #[must_use]
    pub fn exit(&self) -> &Arc<ExitIp> {
        &self.exit
    }

    /// Convert into an active connection (`OnConnectionStart`)
    pub fn commit(mut self) -> ConnectionGuard {
        self.done = true;
        self.exit.commit_reservation();
        ConnectionGuard::started(Arc::clone(&self.exit))
    }

    /// Give the slot back without connecting
    pub fn release(mut self) {
        self.done = true;
        self.exit.release_reservation();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            self.exit.release_reservation();
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("exit", &self.exit.address())
            .field("done", &self.done)
            .finish()
    }
}

/// One active connection on an exit
///
/// `end()` or drop performs `OnConnectionEnd`: the active counter is
/// decremented and the connection duration recorded, exactly once.
#[must_use = "dropping the guard ends the connection immediately"]
pub struct ConnectionGuard {
    exit: Arc<ExitIp>,
    started: Instant,
    ended: bool,
}

impl ConnectionGuard {
    /// Wrap a connection whose active count was already incremented
    pub(crate) fn started(exit: Arc<ExitIp>) -> Self {
        Self {
            exit,
            started: Instant::now(),
            ended: false,
        }
    }

    /// Exit this connection is counted on
    #[must_use]
    pub fn exit(&self) -> IpAddr {
        self.exit.address()
    }

    /// Time since the connection started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// End the connection and return its duration
    pub fn end(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        self.ended = true;
        let duration = self.started.elapsed();
        if !self.exit.decrement_active() {
            warn!(
                exit = %self.exit.address(),
                "Active connection counter underflow on connection end"
            );
        }
        self.exit.record_connection_duration(duration);
        debug!(
            exit = %self.exit.address(),
            duration_ms = duration.as_millis() as u64,
            active = self.exit.active_connections(),
            "Connection ended"
        );
        duration
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.ended {
            self.finish();
        }
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("exit", &self.exit.address())
            .field("elapsed", &self.started.elapsed())
            .field("ended", &self.ended)
            .finish()
    }
}
