//! Reachability probes through an exit

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::SockAddr;
use tracing::trace;

use crate::dialer::OutboundSocket;
use crate::error::ProbeError;
use crate::pool::ExitIp;
use crate::routing::{set_bind_device, set_routing_mark};

/// One reachability check through one exit
#[async_trait]
pub trait ExitProbe: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Probe `exit`; `Ok` means the exit can reach the internet
    async fn probe(&self, exit: &ExitIp) -> Result<(), ProbeError>;
}

/// TCP connect probe sourced from the exit's address and interface
///
/// The socket is bound to the exit address, pinned to the exit's interface
/// with `SO_BINDTODEVICE` and, once provisioned, carries the exit's fwmark,
/// so the probe takes the same path as steered traffic.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    targets: Vec<SocketAddr>,
    timeout: Duration,
    bind_device: bool,
}

impl TcpConnectProbe {
    #[must_use]
    pub fn new(targets: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            targets,
            timeout,
            bind_device: true,
        }
    }

    /// Skip `SO_BINDTODEVICE` (it needs `CAP_NET_RAW`)
    #[must_use]
    pub fn without_bind_device(mut self) -> Self {
        self.bind_device = false;
        self
    }

    fn targets_for(&self, exit: &ExitIp) -> impl Iterator<Item = SocketAddr> + '_ {
        let v4 = exit.address().is_ipv4();
        self.targets.iter().copied().filter(move |t| t.is_ipv4() == v4)
    }

    async fn probe_target(&self, exit: &ExitIp, target: SocketAddr) -> Result<(), ProbeError> {
        let failed = |reason: String| ProbeError::ConnectFailed {
            exit: exit.address(),
            target,
            reason,
        };

        let socket = OutboundSocket::tcp_for(target).map_err(|e| failed(e.to_string()))?;
        socket
            .socket()
            .bind(&SockAddr::from(SocketAddr::new(exit.address(), 0)))
            .map_err(|e| failed(format!("bind {}: {e}", exit.address())))?;
        if self.bind_device {
            set_bind_device(socket.socket(), exit.interface())
                .map_err(|e| failed(e.to_string()))?;
        }
        if let Some(mark) = exit.table_id() {
            set_routing_mark(socket.socket(), mark).map_err(|e| failed(e.to_string()))?;
        }

        socket
            .connect(target, self.timeout)
            .await
            .map(drop)
            .map_err(|e| failed(e.to_string()))
    }
}

#[async_trait]
impl ExitProbe for TcpConnectProbe {
    fn name(&self) -> &'static str {
        "tcp_connect"
    }

    async fn probe(&self, exit: &ExitIp) -> Result<(), ProbeError> {
        let mut last_error = ProbeError::NoTarget(exit.address());
        for target in self.targets_for(exit) {
            match self.probe_target(exit, target).await {
                Ok(()) => {
                    trace!(exit = %exit.address(), target = %target, "Probe succeeded");
                    return Ok(());
                }
                Err(e) => {
                    trace!(exit = %exit.address(), target = %target, error = %e, "Probe failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
