//! Static TCP forward listener

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ForwardConfig;
use crate::dialer::ExitDialer;
use crate::selector::SelectionKey;

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Forward counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    pub name: String,
    pub accepted: u64,
    pub active: u64,
    pub dial_failures: u64,
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    dial_failures: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Accepts clients and relays each through a steered connection
pub struct ForwardListener {
    listener: TcpListener,
    config: ForwardConfig,
    dialer: Arc<ExitDialer>,
    counters: Arc<Counters>,
    shutdown_tx: broadcast::Sender<()>,
    active: AtomicBool,
}

impl ForwardListener {
    /// Bind the forward's listen address
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(config: ForwardConfig, dialer: Arc<ExitDialer>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            forward = %config.name,
            listen = %listener.local_addr()?,
            target = %format!("{}:{}", config.target_host, config.target_port),
            sticky_by_client = config.sticky_by_client,
            "Forward listener ready"
        );

        Ok(Self {
            listener,
            config,
            dialer,
            counters: Arc::new(Counters::default()),
            shutdown_tx,
            active: AtomicBool::new(true),
        })
    }

    /// Accept until [`ForwardListener::shutdown`]
    ///
    /// Relays already in progress keep running after shutdown and end on
    /// their own.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !self.is_active() {
            return;
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((client, peer)) => {
                            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                            let dialer = Arc::clone(&self.dialer);
                            let counters = Arc::clone(&self.counters);
                            let key = self.selection_key(peer);
                            let name = self.config.name.clone();
                            tokio::spawn(async move {
                                relay(client, peer, key, dialer, counters, name).await;
                            });
                        }
                        Err(e) => {
                            error!(forward = %self.config.name, error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(forward = %self.config.name, "Forward listener shutdown signal received");
                    return;
                }
            }
        }
    }

    /// Stop accepting
    pub fn shutdown(&self) {
        info!(forward = %self.config.name, "Shutting down forward listener");
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Bound address (differs from the config when it asked for port 0)
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> ForwardStats {
        ForwardStats {
            name: self.config.name.clone(),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            dial_failures: self.counters.dial_failures.load(Ordering::Relaxed),
            bytes_client_to_target: self.counters.bytes_up.load(Ordering::Relaxed),
            bytes_target_to_client: self.counters.bytes_down.load(Ordering::Relaxed),
        }
    }

    fn selection_key(&self, peer: SocketAddr) -> SelectionKey {
        let key = SelectionKey::new(self.config.target_host.clone(), self.config.target_port);
        if self.config.sticky_by_client {
            key.with_sticky_key(peer.ip().to_string())
        } else {
            key
        }
    }
}

impl std::fmt::Debug for ForwardListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardListener")
            .field("name", &self.config.name)
            .field("listen", &self.listener.local_addr().ok())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

async fn relay(
    mut client: TcpStream,
    peer: SocketAddr,
    key: SelectionKey,
    dialer: Arc<ExitDialer>,
    counters: Arc<Counters>,
    name: String,
) {
    let conn = match dialer.dial(&key).await {
        Ok(conn) => conn,
        Err(e) => {
            counters.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(forward = %name, client = %peer, error = %e, "Dropping client, dial failed");
            return;
        }
    };

    let exit = conn.exit();
    let (mut upstream, guard) = conn.into_parts();
    if let Err(e) = client.set_nodelay(true) {
        debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY on client");
    }

    counters.active.fetch_add(1, Ordering::Relaxed);
    let result = copy_bidirectional(&mut client, &mut upstream).await;
    if let Ok((up, down)) = result {
        counters.bytes_up.fetch_add(up, Ordering::Relaxed);
        counters.bytes_down.fetch_add(down, Ordering::Relaxed);
    }
    counters.active.fetch_sub(1, Ordering::Relaxed);
    drop(upstream);
    let duration = guard.end();

    match result {
        Ok((up, down)) => {
            debug!(
                forward = %name,
                client = %peer,
                exit = %exit,
                bytes_up = up,
                bytes_down = down,
                duration_ms = duration.as_millis() as u64,
                "Relay finished"
            );
        }
        Err(e) => {
            debug!(forward = %name, client = %peer, exit = %exit, error = %e, "Relay ended with error");
        }
    }
}
