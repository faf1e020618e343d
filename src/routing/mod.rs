//! Kernel routing state for exits
//!
//! Each exit is steered with fwmark policy routing plus source NAT:
//!
//! ```text
//! socket (SO_MARK = T) --> ip rule fwmark T lookup T --> table T: default via gw dev iface
//!                                                               |
//!                      POSTROUTING: mark T -> SNAT --to-source exit address
//! ```
//!
//! - [`RoutingManager`]: lifecycle (`setup`, `mark_connection`, `cleanup`)
//! - [`RoutingBackend`]: platform seam
//! - [`LinuxBackend`]: iproute2 + iptables implementation
//! - [`MemoryBackend`]: in-memory test double
//! - [`TableAllocator`]: monotonic table id / fwmark allocation

mod allocator;
mod backend;
mod linux;
mod manager;
mod memory;

pub use allocator::{TableAllocator, TableAllocatorError};
pub use backend::{RoutingBackend, RoutingRule, INSTALL_ORDER};
pub use linux::{
    has_net_admin_capability, is_root, set_bind_device, set_routing_mark, LinuxBackend,
    NAT_COMMENT,
};
pub use manager::{RoutingManager, RoutingState, RoutingStats};
pub use memory::MemoryBackend;
