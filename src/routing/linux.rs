//! Linux routing backend
//!
//! Provisions each exit with iproute2 and iptables/ip6tables:
//!
//! ```text
//! ip [-6] route replace default via <gw> dev <iface> src <addr> table <T>
//! ip [-6] rule add fwmark <T> lookup <T> priority <P>
//! ip[6]tables -t nat -A POSTROUTING -m mark --mark <T> -j SNAT --to-source <addr>
//! ```
//!
//! Sockets are steered with `SO_MARK`, which requires `CAP_NET_ADMIN`.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{Command, Output};

use socket2::Socket;
use tracing::{debug, info};

use super::backend::{RoutingBackend, RoutingRule};
use crate::config::MAX_INTERFACE_NAME_LEN;
use crate::error::{ArtifactKind, BackendError};

/// Comment attached to every NAT rule this process creates
pub const NAT_COMMENT: &str = "exit-router";

/// Upper bound on stale duplicate policy rules purged before an add
const MAX_STALE_RULES: usize = 16;

/// Backend that shells out to `ip` and `iptables`
#[derive(Debug, Clone)]
pub struct LinuxBackend {
    sysfs_net: String,
}

impl LinuxBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sysfs_net: "/sys/class/net".into(),
        }
    }

    fn interface_exists(&self, interface: &str) -> bool {
        Path::new(&self.sysfs_net).join(interface).exists()
    }

    fn install_route(&self, rule: &RoutingRule) -> Result<(), BackendError> {
        if !self.interface_exists(&rule.interface) {
            return Err(BackendError::MissingInterface(rule.interface.clone()));
        }
        run("ip", &route_args(rule, "replace"))
    }

    fn install_policy_rule(rule: &RoutingRule) -> Result<(), BackendError> {
        // A crashed previous run may have left identical rules behind
        let del = policy_rule_args(rule, "del");
        for _ in 0..MAX_STALE_RULES {
            if run("ip", &del).is_err() {
                break;
            }
            debug!(rule = %rule, "Removed stale policy rule");
        }
        run("ip", &policy_rule_args(rule, "add"))
    }

    fn install_snat(rule: &RoutingRule) -> Result<(), BackendError> {
        let tool = iptables_tool(rule);
        if run(tool, &snat_args(rule, "-C")).is_ok() {
            info!(rule = %rule, "Adopting existing SNAT rule");
            return Ok(());
        }
        run(tool, &snat_args(rule, "-A"))
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn install(&self, kind: ArtifactKind, rule: &RoutingRule) -> Result<(), BackendError> {
        match kind {
            ArtifactKind::Route => self.install_route(rule),
            ArtifactKind::PolicyRule => Self::install_policy_rule(rule),
            ArtifactKind::Snat => Self::install_snat(rule),
        }
    }

    fn remove(&self, kind: ArtifactKind, rule: &RoutingRule) -> Result<(), BackendError> {
        let result = match kind {
            ArtifactKind::Route => run("ip", &route_args(rule, "del")),
            ArtifactKind::PolicyRule => run("ip", &policy_rule_args(rule, "del")),
            ArtifactKind::Snat => run(iptables_tool(rule), &snat_args(rule, "-D")),
        };
        match result {
            Err(BackendError::CommandFailed { ref stderr, .. }) if is_already_absent(stderr) => {
                debug!(rule = %rule, kind = %kind, "Artifact already absent");
                Ok(())
            }
            other => other,
        }
    }

    fn mark_socket(&self, socket: &Socket, rule: &RoutingRule) -> Result<(), BackendError> {
        set_routing_mark(socket, rule.fwmark)
    }
}

fn family_flag(rule: &RoutingRule) -> Option<&'static str> {
    rule.is_ipv6().then_some("-6")
}

fn iptables_tool(rule: &RoutingRule) -> &'static str {
    if rule.is_ipv6() {
        "ip6tables"
    } else {
        "iptables"
    }
}

/// `ip route <op> default ...` arguments
pub(crate) fn route_args(rule: &RoutingRule, op: &str) -> Vec<String> {
    let gateway = rule.gateway.to_string();
    let address = rule.address.to_string();
    let table = rule.table_id.to_string();
    let mut args: Vec<String> = family_flag(rule).into_iter().map(String::from).collect();
    args.extend(
        [
            "route",
            op,
            "default",
            "via",
            gateway.as_str(),
            "dev",
            rule.interface.as_str(),
            "src",
            address.as_str(),
            "table",
            table.as_str(),
        ]
        .map(String::from),
    );
    args
}

/// `ip rule <op> fwmark ...` arguments
pub(crate) fn policy_rule_args(rule: &RoutingRule, op: &str) -> Vec<String> {
    let mark = rule.fwmark.to_string();
    let table = rule.table_id.to_string();
    let priority = rule.priority.to_string();
    let mut args: Vec<String> = family_flag(rule).into_iter().map(String::from).collect();
    args.extend(
        [
            "rule",
            op,
            "fwmark",
            mark.as_str(),
            "lookup",
            table.as_str(),
            "priority",
            priority.as_str(),
        ]
        .map(String::from),
    );
    args
}

/// `iptables -t nat <op> POSTROUTING ...` arguments
pub(crate) fn snat_args(rule: &RoutingRule, op: &str) -> Vec<String> {
    let mark = rule.fwmark.to_string();
    let address = rule.address.to_string();
    [
        "-t",
        "nat",
        op,
        "POSTROUTING",
        "-m",
        "mark",
        "--mark",
        mark.as_str(),
        "-m",
        "comment",
        "--comment",
        NAT_COMMENT,
        "-j",
        "SNAT",
        "--to-source",
        address.as_str(),
    ]
    .map(String::from)
    .to_vec()
}

fn run(program: &str, args: &[String]) -> Result<(), BackendError> {
    let command = format!("{program} {}", args.join(" "));
    debug!("Running: {}", command);

    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(classify(command, &output))
}

fn classify(command: String, output: &Output) -> BackendError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let status = output
        .status
        .code()
        .map_or_else(|| "signal".to_string(), |c| format!("exit {c}"));
    classify_stderr(command, status, stderr)
}

pub(crate) fn classify_stderr(command: String, status: String, stderr: String) -> BackendError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("operation not permitted") || lower.contains("permission denied") {
        BackendError::PermissionDenied(format!("{command}: {stderr}"))
    } else if lower.contains("cannot find device") {
        BackendError::MissingInterface(stderr)
    } else if lower.contains("file exists") {
        BackendError::Conflict(format!("{command}: {stderr}"))
    } else {
        BackendError::CommandFailed {
            command,
            status,
            stderr,
        }
    }
}

fn is_already_absent(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such process")
        || lower.contains("no such file or directory")
        || lower.contains("does a matching rule exist")
        || lower.contains("bad rule")
}

/// Set `SO_MARK` for policy routing
///
/// # Errors
///
/// Returns `BackendError::PermissionDenied` without `CAP_NET_ADMIN`, or
/// `BackendError::SocketOption` for any other failure.
pub fn set_routing_mark(socket: &Socket, mark: u32) -> Result<(), BackendError> {
    let fd = socket.as_raw_fd();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::PermissionDenied {
            return Err(BackendError::PermissionDenied(format!(
                "SO_MARK {mark}: {err}"
            )));
        }
        return Err(BackendError::socket_option(
            "SO_MARK",
            format!("Failed to set routing mark {mark}: {err}"),
        ));
    }

    debug!("Set routing mark: {}", mark);
    Ok(())
}

/// Bind a socket to an interface with `SO_BINDTODEVICE`
///
/// # Errors
///
/// Returns `BackendError::SocketOption` if the name is too long or the
/// option cannot be set.
pub fn set_bind_device(socket: &Socket, interface: &str) -> Result<(), BackendError> {
    // Interface name must be null-terminated and fit in IFNAMSIZ (16 bytes)
    if interface.len() > MAX_INTERFACE_NAME_LEN {
        return Err(BackendError::socket_option(
            "SO_BINDTODEVICE",
            format!("Interface name too long: {interface} (max 15 chars)"),
        ));
    }

    let fd = socket.as_raw_fd();
    let mut ifname = [0u8; 16];
    ifname[..interface.len()].copy_from_slice(interface.as_bytes());

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr().cast::<libc::c_void>(),
            ifname.len() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(BackendError::socket_option(
            "SO_BINDTODEVICE",
            format!("Failed to bind to interface {interface}: {err}"),
        ));
    }

    debug!("Bound socket to interface: {}", interface);
    Ok(())
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check whether this process may set `SO_MARK`
///
/// Probes with a throwaway socket, so it also covers `CAP_NET_ADMIN`
/// granted without root.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    let Ok(socket) = Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None) else {
        return false;
    };
    !matches!(
        set_routing_mark(&socket, 0),
        Err(BackendError::PermissionDenied(_))
    )
}
