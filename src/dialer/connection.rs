//! Established connection steered through an exit

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::pool::ConnectionGuard;

/// TCP stream plus the guard that counts it against its exit
///
/// Dropping the connection ends the guard; [`SteeredConnection::finish`] does
/// the same and reports the session duration.
#[derive(Debug)]
pub struct SteeredConnection {
    stream: TcpStream,
    target: SocketAddr,
    fwmark: Option<u32>,
    guard: ConnectionGuard,
}

impl SteeredConnection {
    pub(crate) fn new(
        stream: TcpStream,
        target: SocketAddr,
        fwmark: Option<u32>,
        guard: ConnectionGuard,
    ) -> Self {
        Self {
            stream,
            target,
            fwmark,
            guard,
        }
    }

    /// Exit carrying this connection
    #[must_use]
    pub fn exit(&self) -> IpAddr {
        self.guard.exit()
    }

    /// Resolved target address
    #[must_use]
    pub const fn target(&self) -> SocketAddr {
        self.target
    }

    /// Mark applied to the socket; `None` when kernel steering is disabled
    #[must_use]
    pub const fn fwmark(&self) -> Option<u32> {
        self.fwmark
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.guard.elapsed()
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Split into the stream and its guard
    ///
    /// The caller becomes responsible for ending the guard once the stream
    /// is closed.
    #[must_use]
    pub fn into_parts(self) -> (TcpStream, ConnectionGuard) {
        (self.stream, self.guard)
    }

    /// Close the stream and end the connection (`OnConnectionEnd`)
    pub fn finish(self) -> Duration {
        drop(self.stream);
        self.guard.end()
    }
}
