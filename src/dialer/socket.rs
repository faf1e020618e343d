//! Outbound socket handle
//!
//! A socket is created unconnected, bound to an exit by the routing manager,
//! and only then connected. The binding is recorded on the handle itself so a
//! second bind is an explicit error rather than a silent re-mark.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// Mark applied to one outbound socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionBinding {
    pub exit: IpAddr,
    pub fwmark: u32,
}

/// Unconnected TCP socket plus its exit binding
#[derive(Debug)]
pub struct OutboundSocket {
    socket: Socket,
    binding: Option<ConnectionBinding>,
}

impl OutboundSocket {
    /// Create a non-blocking TCP socket for the family of `target`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be created or configured.
    pub fn tcp_for(target: SocketAddr) -> io::Result<Self> {
        let domain = if target.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        // Detect dead peers on long-lived relays
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive: {}", e);
        }

        Ok(Self {
            socket,
            binding: None,
        })
    }

    /// Underlying socket, for setting options before connect
    #[must_use]
    pub const fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Exit this socket was bound to, if any
    #[must_use]
    pub const fn binding(&self) -> Option<ConnectionBinding> {
        self.binding
    }

    pub(crate) fn set_binding(&mut self, binding: ConnectionBinding) {
        self.binding = Some(binding);
    }

    /// Connect with a timeout, consuming the handle
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` on timeout, or the connect error reported by the socket.
    pub async fn connect(self, addr: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
        // EINPROGRESS is expected for non-blocking sockets
        match self.socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        // TcpStream owns the fd from here on and closes it on drop
        let std_stream: std::net::TcpStream = self.socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        let connected = timeout(connect_timeout, async {
            stream.writable().await?;
            match stream.take_error()? {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {}s", connect_timeout.as_secs()),
            )),
        }
    }
}
