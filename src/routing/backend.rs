//! Routing backend abstraction
//!
//! Kernel side effects (routing tables, policy rules, NAT) are process-wide
//! and only partially reversible. The [`RoutingManager`](super::RoutingManager)
//! drives them through this trait so tests can substitute
//! [`MemoryBackend`](super::MemoryBackend) and run without privileges.

use std::fmt;
use std::net::IpAddr;

use socket2::Socket;

use crate::error::{ArtifactKind, BackendError};
use crate::pool::ExitIp;

/// Everything the kernel needs to steer marked traffic out of one exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub address: IpAddr,
    pub interface: String,
    pub gateway: IpAddr,
    pub table_id: u32,
    /// Socket mark selecting `table_id`; equal to it
    pub fwmark: u32,
    pub priority: u32,
}

impl RoutingRule {
    /// Build the rule for `exit` using `table_id` as table and mark
    #[must_use]
    pub fn for_exit(exit: &ExitIp, table_id: u32, priority: u32) -> Self {
        Self {
            address: exit.address(),
            interface: exit.interface().to_string(),
            gateway: exit.gateway(),
            table_id,
            fwmark: table_id,
            priority,
        }
    }

    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }
}

impl fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev {} table {} mark {:#x}",
            self.address, self.gateway, self.interface, self.table_id, self.fwmark
        )
    }
}

/// Artifacts in installation order; removal uses the reverse
pub const INSTALL_ORDER: [ArtifactKind; 3] =
    [ArtifactKind::Route, ArtifactKind::PolicyRule, ArtifactKind::Snat];

/// Platform operations the routing manager needs
///
/// Calls are synchronous and may block (they spawn commands); async
/// callers run them on a blocking thread.
pub trait RoutingBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Install one artifact of `rule`
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the platform refuses the change.
    fn install(&self, kind: ArtifactKind, rule: &RoutingRule) -> Result<(), BackendError>;

    /// Remove one artifact of `rule`
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the artifact could not be removed.
    fn remove(&self, kind: ArtifactKind, rule: &RoutingRule) -> Result<(), BackendError>;

    /// Apply `rule.fwmark` to an unconnected socket
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the socket option cannot be set.
    fn mark_socket(&self, socket: &Socket, rule: &RoutingRule) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_for_exit() {
        let exit = ExitIp::new(
            "2001:db8::10".parse().unwrap(),
            "eth1",
            "fe80::1".parse().unwrap(),
        );
        let rule = RoutingRule::for_exit(&exit, 1003, 10000);
        assert_eq!(rule.table_id, rule.fwmark);
        assert!(rule.is_ipv6());
        assert_eq!(
            rule.to_string(),
            "2001:db8::10 via fe80::1 dev eth1 table 1003 mark 0x3eb"
        );
    }
}
