//! Select, bind, dial, count
//!
//! # Dial path
//!
//! ```text
//! resolve(host) -> exclude exits without a same-family target -> select
//!     -> reserve (pending load) -> socket -> mark_connection -> connect
//!     -> commit (active load) -> SteeredConnection
//! ```
//!
//! A bind failure excludes the exit and retries the whole selection once.
//! A connect failure is returned to the caller: the bytes never leave
//! through the default route.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::connection::SteeredConnection;
use super::socket::OutboundSocket;
use crate::config::DialConfig;
use crate::error::{target_label, BindError, DialError};
use crate::pool::{ExitIp, ExitPool, Reservation};
use crate::routing::RoutingManager;
use crate::selector::{IpSelector, SelectionKey};

/// Selections attempted before a contended least-connections claim gives up
/// on compare-and-swap and reserves unconditionally
const MAX_CLAIM_ATTEMPTS: usize = 64;

/// Exits tried when binding fails
const MAX_BIND_ATTEMPTS: usize = 2;

/// Dialer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialerStats {
    pub dials: u64,
    pub established: u64,
    pub no_healthy_exit: u64,
    pub bind_failures: u64,
    pub connect_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dials: AtomicU64,
    established: AtomicU64,
    no_healthy_exit: AtomicU64,
    bind_failures: AtomicU64,
    connect_failures: AtomicU64,
}

enum Attempt {
    Bind(BindError),
    Connect(String),
}

/// Opens outbound TCP connections through a chosen exit
pub struct ExitDialer {
    pool: Arc<ExitPool>,
    selector: Arc<IpSelector>,
    routing: Arc<RoutingManager>,
    connect_timeout: Duration,
    counters: Counters,
}

impl ExitDialer {
    #[must_use]
    pub fn new(
        pool: Arc<ExitPool>,
        selector: Arc<IpSelector>,
        routing: Arc<RoutingManager>,
        config: &DialConfig,
    ) -> Self {
        Self {
            pool,
            selector,
            routing,
            connect_timeout: config.connect_timeout(),
            counters: Counters::default(),
        }
    }

    /// Override the connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ExitPool> {
        &self.pool
    }

    #[must_use]
    pub fn selector(&self) -> &Arc<IpSelector> {
        &self.selector
    }

    /// Dial `host:port` through an exit chosen for that destination
    ///
    /// # Errors
    ///
    /// See [`ExitDialer::dial`].
    pub async fn dial_for_target(
        &self,
        host: &str,
        port: u16,
    ) -> Result<SteeredConnection, DialError> {
        self.dial(&SelectionKey::new(host, port)).await
    }

    /// Dial the key's target through an exit chosen for `key`
    ///
    /// # Errors
    ///
    /// - `NoHealthyExit` if no selectable exit shares a family with the target
    /// - `BindFailed` if the socket could not be marked for two different exits
    /// - `DialFailed` if resolution or the TCP connect failed
    pub async fn dial(&self, key: &SelectionKey) -> Result<SteeredConnection, DialError> {
        self.counters.dials.fetch_add(1, Ordering::Relaxed);
        let label = target_label(&key.target_host, key.target_port);

        let targets = resolve(&key.target_host, key.target_port)
            .await
            .map_err(|reason| DialError::dial_failed(&label, None, reason))?;

        let mut excluded = self.family_mismatches(&targets);
        let mut last_bind_error = None;

        for attempt in 0..MAX_BIND_ATTEMPTS {
            let reservation = match self.reserve(key, &excluded) {
                Ok(r) => r,
                Err(e) => {
                    // A bind failure that drained the pool is still a bind failure
                    if let Some(err) = last_bind_error {
                        return Err(err);
                    }
                    self.counters.no_healthy_exit.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let exit = Arc::clone(reservation.exit());
            let address = exit.address();
            let family: Vec<SocketAddr> = targets
                .iter()
                .copied()
                .filter(|t| t.is_ipv4() == address.is_ipv4())
                .collect();

            match self.connect_any(&exit, &family).await {
                Ok((stream, target, fwmark)) => {
                    let guard = reservation.commit();
                    self.counters.established.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target = %label,
                        resolved = %target,
                        exit = %address,
                        fwmark = ?fwmark,
                        "Dial established"
                    );
                    return Ok(SteeredConnection::new(stream, target, fwmark, guard));
                }
                Err(Attempt::Bind(e)) => {
                    reservation.release();
                    self.counters.bind_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        exit = %address,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to bind dial to exit"
                    );
                    let recoverable = e.is_recoverable();
                    last_bind_error = Some(DialError::BindFailed {
                        exit: address,
                        reason: e.to_string(),
                    });
                    if !recoverable {
                        break;
                    }
                    excluded.push(address);
                }
                Err(Attempt::Connect(reason)) => {
                    reservation.release();
                    exit.record_failed_dial();
                    self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(target = %label, exit = %address, error = %reason, "Dial failed");
                    return Err(DialError::dial_failed(label, Some(address), reason));
                }
            }
        }

        Err(last_bind_error.unwrap_or(DialError::NoHealthyExit))
    }

    #[must_use]
    pub fn stats(&self) -> DialerStats {
        DialerStats {
            dials: self.counters.dials.load(Ordering::Relaxed),
            established: self.counters.established.load(Ordering::Relaxed),
            no_healthy_exit: self.counters.no_healthy_exit.load(Ordering::Relaxed),
            bind_failures: self.counters.bind_failures.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Private Methods
    // ========================================================================

    /// Exits that cannot reach any resolved target
    fn family_mismatches(&self, targets: &[SocketAddr]) -> Vec<IpAddr> {
        let has_v4 = targets.iter().any(SocketAddr::is_ipv4);
        let has_v6 = targets.iter().any(SocketAddr::is_ipv6);
        self.pool
            .snapshot()
            .entries()
            .iter()
            .map(|e| e.exit.address())
            .filter(|a| if a.is_ipv4() { !has_v4 } else { !has_v6 })
            .collect()
    }

    /// Select an exit and count a pending dial against it
    fn reserve(&self, key: &SelectionKey, excluded: &[IpAddr]) -> Result<Reservation, DialError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let snapshot = self.pool.snapshot();
            let selection = self.selector.select_excluding(&snapshot, key, excluded)?;
            match selection.observed_load {
                Some(observed) => {
                    if let Some(reservation) = Reservation::claim(&selection.exit, observed) {
                        return Ok(reservation);
                    }
                    trace!(exit = %selection.address(), "Load changed during selection, retrying");
                }
                None => return Ok(Reservation::acquire(&selection.exit)),
            }
        }

        let selection = self
            .selector
            .select_excluding(&self.pool.snapshot(), key, excluded)?;
        debug!(exit = %selection.address(), "Claim contended, reserving unconditionally");
        Ok(Reservation::acquire(&selection.exit))
    }

    /// Try each same-family target through `exit`
    async fn connect_any(
        &self,
        exit: &ExitIp,
        targets: &[SocketAddr],
    ) -> Result<(TcpStream, SocketAddr, Option<u32>), Attempt> {
        let mut last_error = String::from("no address of the exit's family");
        for &target in targets {
            let mut socket =
                OutboundSocket::tcp_for(target).map_err(|e| Attempt::Connect(e.to_string()))?;
            self.routing
                .mark_connection(&mut socket, exit)
                .map_err(Attempt::Bind)?;
            let fwmark = socket.binding().map(|b| b.fwmark);

            match socket.connect(target, self.connect_timeout).await {
                Ok(stream) => return Ok((stream, target, fwmark)),
                Err(e) => {
                    trace!(target = %target, exit = %exit.address(), error = %e, "Connect attempt failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(Attempt::Connect(last_error))
    }
}

impl std::fmt::Debug for ExitDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitDialer")
            .field("strategy", &self.selector.strategy())
            .field("connect_timeout", &self.connect_timeout)
            .field("exits", &self.pool.len())
            .finish_non_exhaustive()
    }
}

/// Resolve `host` to socket addresses; IP literals skip DNS
async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, String> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("resolve {host}: {e}"))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("resolve {host}: no addresses"));
    }
    Ok(addrs)
}
