//! Error types for exit-router
//!
//! This module defines the error hierarchy for the egress steering engine.
//! Errors are grouped by the component that raises them and carry a
//! recoverability hint so callers can decide between retrying and failing.
//!
//! # Taxonomy
//!
//! | Error | Scope | Fatal |
//! |-------|-------|-------|
//! | [`ConfigError`] | startup | yes |
//! | [`SelectError::NoHealthyExit`] | one session | no |
//! | [`BindError`] | one connection | no |
//! | [`DialError`] | one session | no |
//! | [`RoutingError::SetupPartialFailure`] | startup | no |
//! | [`RoutingError::CleanupIncomplete`] | shutdown | no |

use std::fmt::Write as _;
use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Top-level error type for exit-router
#[derive(Debug, Error)]
pub enum ExitRouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pool lookups
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Kernel routing provisioning/teardown
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Per-session dial errors
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ExitRouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Pool(_) => false,
            Self::Routing(e) => e.is_recoverable(),
            Self::Dial(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid exit, interface, gateway, ...)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Exit pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The address is not a configured exit
    #[error("Unknown exit: {0}")]
    UnknownExit(IpAddr),
}

impl PoolError {
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Selection errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// The health-filtered pool is empty
    #[error("No healthy exit available")]
    NoHealthyExit,
}

impl SelectError {
    /// Health may return on the next monitor tick
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Errors raised by a routing backend (kernel or test double)
#[derive(Debug, Error)]
pub enum BackendError {
    /// Missing `CAP_NET_ADMIN` or equivalent
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The exit's interface does not exist
    #[error("Interface not found: {0}")]
    MissingInterface(String),

    /// An equivalent kernel object already exists
    #[error("Conflicting kernel state: {0}")]
    Conflict(String),

    /// A routing command exited unsuccessfully
    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Failed to set a socket option (SO_MARK, SO_BINDTODEVICE)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Operation refused by the backend
    #[error("Rejected: {0}")]
    Rejected(String),

    /// I/O error spawning a command
    #[error("Backend I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    /// Privilege and missing-interface failures need operator action
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::PermissionDenied(_) | Self::MissingInterface(_))
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Errors binding an outbound socket to an exit
#[derive(Debug, Error)]
pub enum BindError {
    /// `mark_connection` called outside the Ready state
    #[error("Routing manager is not ready")]
    NotReady,

    /// The exit has no provisioned routing rule
    #[error("Exit {0} is not provisioned")]
    NotProvisioned(IpAddr),

    /// The socket handle is already bound to an exit
    #[error("Socket is already bound to exit {0}")]
    AlreadyBound(IpAddr),

    /// The platform refused the bind
    #[error("Failed to bind socket to exit {exit}: {source}")]
    Backend {
        exit: IpAddr,
        #[source]
        source: BackendError,
    },
}

impl BindError {
    /// Whether another exit might succeed where this one failed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotProvisioned(_) | Self::Backend { .. })
    }
}

/// Errors returned to callers of `dial_for_target`
#[derive(Debug, Error)]
pub enum DialError {
    /// No selectable exit
    #[error("No healthy exit available")]
    NoHealthyExit,

    /// Target resolution or TCP connect failed
    #[error("Failed to dial {target}{}: {reason}", via(.exit))]
    DialFailed {
        target: String,
        exit: Option<IpAddr>,
        reason: String,
    },

    /// The socket could not be bound to the chosen exit
    #[error("Failed to bind dial to exit {exit}: {reason}")]
    BindFailed { exit: IpAddr, reason: String },
}

fn via(exit: &Option<IpAddr>) -> String {
    exit.map(|e| format!(" via {e}")).unwrap_or_default()
}

impl DialError {
    /// Dial errors are per-session; the process keeps serving
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a dial failed error
    pub fn dial_failed(
        target: impl Into<String>,
        exit: Option<IpAddr>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DialFailed {
            target: target.into(),
            exit,
            reason: reason.into(),
        }
    }
}

impl From<SelectError> for DialError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoHealthyExit => Self::NoHealthyExit,
        }
    }
}

/// Health probe failures
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe did not complete within the configured timeout
    #[error("Probe via {exit} timed out")]
    Timeout { exit: IpAddr },

    /// No probe target shares the exit's address family
    #[error("No probe target for exit {0}")]
    NoTarget(IpAddr),

    /// Socket setup or connect failed
    #[error("Probe via {exit} to {target} failed: {reason}")]
    ConnectFailed {
        exit: IpAddr,
        target: SocketAddr,
        reason: String,
    },
}

impl ProbeError {
    /// A failed probe is itself the signal; the next tick probes again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NoTarget(_))
    }
}

/// Which kernel artifact an operation concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Default route in the exit's table
    Route,
    /// `fwmark -> table` policy rule
    PolicyRule,
    /// Source NAT mapping for the exit's mark
    Snat,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Route => write!(f, "route"),
            Self::PolicyRule => write!(f, "policy rule"),
            Self::Snat => write!(f, "snat"),
        }
    }
}

/// One exit's provisioning or teardown failure
#[derive(Debug, Clone)]
pub struct ExitFailure {
    /// Exit address
    pub exit: IpAddr,
    /// Artifact that failed, if the failure was artifact specific
    pub artifact: Option<ArtifactKind>,
    /// Human readable cause
    pub reason: String,
}

impl std::fmt::Display for ExitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.artifact {
            Some(kind) => write!(f, "{} ({}): {}", self.exit, kind, self.reason),
            None => write!(f, "{}: {}", self.exit, self.reason),
        }
    }
}

fn join_failures(failures: &[ExitFailure]) -> String {
    let mut out = String::new();
    for (i, failure) in failures.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{failure}");
    }
    out
}

/// Aggregated routing lifecycle errors
#[derive(Debug, Error)]
pub enum RoutingError {
    /// One or more exits could not be provisioned
    #[error("Setup failed for {} exit(s): {}", .failures.len(), join_failures(.failures))]
    SetupPartialFailure { failures: Vec<ExitFailure> },

    /// Teardown left kernel state behind
    #[error("Cleanup left {} artifact(s) behind: {}", .leftovers.len(), join_failures(.leftovers))]
    CleanupIncomplete { leftovers: Vec<ExitFailure> },
}

impl RoutingError {
    /// Both variants are logged and the process continues
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Per-exit causes carried by this error
    #[must_use]
    pub fn failures(&self) -> &[ExitFailure] {
        match self {
            Self::SetupPartialFailure { failures } => failures,
            Self::CleanupIncomplete { leftovers } => leftovers,
        }
    }
}

/// Result type alias using `ExitRouterError`
pub type Result<T> = std::result::Result<T, ExitRouterError>;

/// Connection-level address helper used in error messages
pub(crate) fn target_label(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_not_recoverable() {
        let err = ConfigError::validation("bad gateway");
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn test_dial_error_display() {
        let err = DialError::dial_failed(
            "example.com:443",
            Some("10.0.0.1".parse().unwrap()),
            "refused",
        );
        assert_eq!(
            err.to_string(),
            "Failed to dial example.com:443 via 10.0.0.1: refused"
        );

        let err = DialError::dial_failed("example.com:443", None, "no address");
        assert_eq!(err.to_string(), "Failed to dial example.com:443: no address");
    }

    #[test]
    fn test_select_error_into_dial_error() {
        let err: DialError = SelectError::NoHealthyExit.into();
        assert!(matches!(err, DialError::NoHealthyExit));
    }

    #[test]
    fn test_setup_partial_failure_enumerates_exits() {
        let err = RoutingError::SetupPartialFailure {
            failures: vec![
                ExitFailure {
                    exit: "10.0.0.2".parse().unwrap(),
                    artifact: Some(ArtifactKind::PolicyRule),
                    reason: "permission denied".into(),
                },
                ExitFailure {
                    exit: "10.0.0.3".parse().unwrap(),
                    artifact: None,
                    reason: "interface missing".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Setup failed for 2 exit(s)"));
        assert!(msg.contains("10.0.0.2 (policy rule): permission denied"));
        assert!(msg.contains("10.0.0.3: interface missing"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn test_bind_error_recoverable() {
        assert!(!BindError::NotReady.is_recoverable());
        assert!(!BindError::AlreadyBound("10.0.0.1".parse().unwrap()).is_recoverable());
        assert!(BindError::NotProvisioned("10.0.0.1".parse().unwrap()).is_recoverable());
    }

    #[test]
    fn test_target_label() {
        assert_eq!(target_label("1.2.3.4", 80), "1.2.3.4:80");
        assert_eq!(target_label("::1", 80), "[::1]:80");
        assert_eq!(target_label("example.com", 443), "example.com:443");
    }

    #[test]
    fn test_top_level_recoverable() {
        let err: ExitRouterError = DialError::NoHealthyExit.into();
        assert!(err.is_recoverable());
        let err: ExitRouterError = ConfigError::validation("x").into();
        assert!(!err.is_recoverable());
    }
}
