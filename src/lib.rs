//! exit-router: multi-exit egress steering for proxy servers
//!
//! Every outbound connection a tunnel handler opens leaves the host through
//! one of several server-owned addresses ("exits"). The exit is chosen per
//! connection by a pluggable strategy, and the kernel is made to actually
//! route and source-NAT the connection through that exit.
//!
//! # Architecture
//!
//! ```text
//! Client → tunnel handler → ExitDialer ─ select ─→ IpSelector (PoolSnapshot)
//!                               │
//!                               ├─ mark_connection ─→ RoutingManager → RoutingBackend
//!                               │
//!                               └─ connect → SteeredConnection (ConnectionGuard)
//!
//! HealthMonitor ── probe ──→ ExitPool.mark_healthy()
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use exit_router::config::load_config;
//! use exit_router::dialer::ExitDialer;
//! use exit_router::pool::ExitPool;
//! use exit_router::routing::{LinuxBackend, RoutingManager};
//! use exit_router::selector::IpSelector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/exit-router/config.json")?;
//!
//! let pool = Arc::new(ExitPool::from_config(&config.exits));
//! let routing = Arc::new(RoutingManager::new(&config.routing, Arc::new(LinuxBackend::new()))?);
//! routing.setup(&pool)?;
//!
//! let dialer = ExitDialer::new(
//!     Arc::clone(&pool),
//!     Arc::new(IpSelector::from_config(&config.selector)),
//!     Arc::clone(&routing),
//!     &config.dial,
//! );
//! let conn = dialer.dial_for_target("example.com", 443).await?;
//! println!("connected via {}", conn.exit());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`dialer`]: Select, bind, dial, count
//! - [`error`]: Error types
//! - [`forward`]: Static TCP forwards
//! - [`health`]: Exit health tracking and probing
//! - [`pool`]: Exit pool, snapshots and load counters
//! - [`routing`]: Kernel routing/NAT lifecycle
//! - [`selector`]: Exit selection strategies

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod dialer;
pub mod error;
pub mod forward;
pub mod health;
pub mod pool;
pub mod routing;
pub mod selector;

// Re-export commonly used types at the crate root
pub use config::{Config, ExitConfig, SelectorStrategy};
pub use dialer::{ExitDialer, SteeredConnection};
pub use error::{
    BackendError, BindError, ConfigError, DialError, ExitRouterError, PoolError, ProbeError,
    RoutingError, SelectError,
};
pub use forward::ForwardListener;
pub use health::{HealthMonitor, TcpConnectProbe};
pub use pool::{ConnectionGuard, ExitIp, ExitPool, PoolSnapshot, PoolStats};
pub use routing::{LinuxBackend, MemoryBackend, RoutingBackend, RoutingManager};
pub use selector::{IpSelector, SelectionKey};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with the privileges kernel steering needs
///
/// # Errors
///
/// Returns `BackendError::PermissionDenied` without root or `CAP_NET_ADMIN`.
pub fn check_capabilities() -> Result<(), BackendError> {
    if !routing::is_root() && !routing::has_net_admin_capability() {
        return Err(BackendError::PermissionDenied(
            "CAP_NET_ADMIN is required to manage routes, rules and NAT".into(),
        ));
    }
    Ok(())
}
