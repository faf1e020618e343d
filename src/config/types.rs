//! Configuration types for exit-router
//!
//! This module defines all configuration structures used by the steering engine.
//! Configuration is loaded from JSON files and validated at startup; a validation
//! failure is fatal and the process must not begin serving.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Linux `IFNAMSIZ` minus the trailing NUL
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Routing tables at or below this id are reserved by the kernel (main, local, default)
pub const RESERVED_TABLE_MAX: u32 = 255;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Ordered list of egress addresses
    pub exits: Vec<ExitConfig>,

    /// Selection strategy configuration
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Health monitor configuration
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Kernel routing configuration
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Outbound dial configuration
    #[serde(default)]
    pub dial: DialConfig,

    /// Static TCP forwards served by the daemon
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exits.is_empty() {
            return Err(ConfigError::validation(
                "At least one exit must be configured",
            ));
        }

        let mut addresses: HashSet<IpAddr> = HashSet::new();
        for exit in &self.exits {
            exit.validate()?;
            if !addresses.insert(exit.address) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate exit address: {}",
                    exit.address
                )));
            }
        }

        self.selector.validate(&addresses)?;
        self.health_check.validate(&self.exits)?;
        self.routing.validate(self.exits.len())?;
        self.dial.validate()?;

        let mut listens: HashSet<SocketAddr> = HashSet::new();
        for forward in &self.forwards {
            forward.validate()?;
            if !listens.insert(forward.listen) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate forward listen address: {}",
                    forward.listen
                )));
            }
        }

        self.log.validate()?;

        Ok(())
    }

    /// Create a minimal default configuration
    ///
    /// The exits use documentation addresses (RFC 5737) and must be edited
    /// before the daemon is started on a real host.
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            exits: vec![
                ExitConfig::new(
                    IpAddr::from([203, 0, 113, 10]),
                    "eth0",
                    IpAddr::from([203, 0, 113, 1]),
                ),
                ExitConfig::new(
                    IpAddr::from([203, 0, 113, 11]),
                    "eth0",
                    IpAddr::from([203, 0, 113, 1]),
                ),
            ],
            selector: SelectorConfig::default(),
            health_check: HealthCheckConfig::default(),
            routing: RoutingConfig::default(),
            dial: DialConfig::default(),
            forwards: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

/// One egress address owned by this host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExitConfig {
    /// Public source address connections will appear to originate from
    pub address: IpAddr,

    /// Interface the address is assigned to
    pub interface: String,

    /// Next hop for the exit's default route
    pub gateway: IpAddr,
}

impl ExitConfig {
    /// Create an exit configuration
    pub fn new(address: IpAddr, interface: impl Into<String>, gateway: IpAddr) -> Self {
        Self {
            address,
            interface: interface.into(),
            gateway,
        }
    }

    /// Validate a single exit entry
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_unspecified() || self.address.is_multicast() {
            return Err(ConfigError::ValidationError(format!(
                "Exit address {} is not a unicast address",
                self.address
            )));
        }

        if self.interface.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Exit {} has an empty interface name",
                self.address
            )));
        }

        if self.interface.len() > MAX_INTERFACE_NAME_LEN {
            return Err(ConfigError::ValidationError(format!(
                "Exit {} interface name '{}' exceeds {} characters",
                self.address, self.interface, MAX_INTERFACE_NAME_LEN
            )));
        }

        if self
            .interface
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\0')
        {
            return Err(ConfigError::ValidationError(format!(
                "Exit {} interface name '{}' contains invalid characters",
                self.address, self.interface
            )));
        }

        if self.gateway.is_ipv4() != self.address.is_ipv4() {
            return Err(ConfigError::ValidationError(format!(
                "Exit {} gateway {} is a different address family",
                self.address, self.gateway
            )));
        }

        if self.gateway.is_unspecified() || self.gateway.is_multicast() {
            return Err(ConfigError::ValidationError(format!(
                "Exit {} gateway {} is not a unicast address",
                self.address, self.gateway
            )));
        }

        Ok(())
    }
}

/// Exit selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    /// Rotate across healthy exits
    #[default]
    RoundRobin,
    /// Hash the destination (or sticky key) onto the healthy set
    DestinationBased,
    /// Pick the exit with the least active plus pending connections
    LeastConnections,
    /// Static destination port range to exit table
    PortBased,
}

impl SelectorStrategy {
    /// Configuration name of the strategy
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::DestinationBased => "destination_based",
            Self::LeastConnections => "least_connections",
            Self::PortBased => "port_based",
        }
    }
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "destination_based" => Ok(Self::DestinationBased),
            "least_connections" => Ok(Self::LeastConnections),
            "port_based" => Ok(Self::PortBased),
            other => Err(format!("Unknown selector strategy: {other}")),
        }
    }
}

/// Selector configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelectorConfig {
    /// Strategy name
    #[serde(default)]
    pub strategy: SelectorStrategy,

    /// Port range table used by `port_based`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_ranges: Vec<PortRangeConfig>,
}

impl SelectorConfig {
    /// Validate the selector section against the configured exit addresses
    pub fn validate(&self, exits: &HashSet<IpAddr>) -> Result<(), ConfigError> {
        for range in &self.port_ranges {
            range.validate()?;
            if !exits.contains(&range.exit) {
                return Err(ConfigError::ValidationError(format!(
                    "Port range {}-{} maps to unknown exit {}",
                    range.start, range.end, range.exit
                )));
            }
        }

        for (i, a) in self.port_ranges.iter().enumerate() {
            for b in &self.port_ranges[i + 1..] {
                if a.start <= b.end && b.start <= a.end {
                    return Err(ConfigError::ValidationError(format!(
                        "Port ranges {}-{} and {}-{} overlap",
                        a.start, a.end, b.start, b.end
                    )));
                }
            }
        }

        if self.strategy == SelectorStrategy::PortBased && self.port_ranges.is_empty() {
            return Err(ConfigError::validation(
                "port_based strategy requires at least one port range",
            ));
        }

        Ok(())
    }
}

/// Inclusive destination port range bound to an exit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortRangeConfig {
    /// First port (inclusive)
    pub start: u16,
    /// Last port (inclusive)
    pub end: u16,
    /// Exit address serving the range
    pub exit: IpAddr,
}

impl PortRangeConfig {
    /// Validate a single range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start == 0 || self.start > self.end {
            return Err(ConfigError::ValidationError(format!(
                "Invalid port range {}-{}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Run the background monitor
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between probe rounds
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,

    /// Consecutive successes required to promote an unhealthy exit
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    /// TCP endpoints probed through each exit
    #[serde(default = "default_probe_targets")]
    pub probe_targets: Vec<SocketAddr>,
}

impl HealthCheckConfig {
    /// Validate the health section
    pub fn validate(&self, exits: &[ExitConfig]) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::validation(
                "health_check.interval_secs must be greater than 0",
            ));
        }

        if self.timeout_secs == 0 || self.timeout_secs > self.interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "health_check.timeout_secs must be in 1..={}",
                self.interval_secs
            )));
        }

        if self.recovery_threshold == 0 {
            return Err(ConfigError::validation(
                "health_check.recovery_threshold must be at least 1",
            ));
        }

        if self.enabled {
            for exit in exits {
                let v4 = exit.address.is_ipv4();
                if !self.probe_targets.iter().any(|t| t.is_ipv4() == v4) {
                    return Err(ConfigError::ValidationError(format!(
                        "No {} probe target for exit {}",
                        if v4 { "IPv4" } else { "IPv6" },
                        exit.address
                    )));
                }
            }
        }

        Ok(())
    }

    /// Probe interval as Duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Probe timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
            recovery_threshold: default_recovery_threshold(),
            probe_targets: default_probe_targets(),
        }
    }
}

/// Kernel routing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Manage policy routing and SNAT; when false the routing manager is a no-op
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First routing table id (and fwmark) handed out
    #[serde(default = "default_table_base")]
    pub table_base: u32,

    /// Priority of every `fwmark` policy rule
    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
}

impl RoutingConfig {
    /// Validate the routing section
    pub fn validate(&self, exit_count: usize) -> Result<(), ConfigError> {
        if self.table_base <= RESERVED_TABLE_MAX {
            return Err(ConfigError::ValidationError(format!(
                "routing.table_base must be greater than {RESERVED_TABLE_MAX}"
            )));
        }

        let exit_count = u32::try_from(exit_count).unwrap_or(u32::MAX);
        if self.table_base.checked_add(exit_count).is_none() {
            return Err(ConfigError::validation(
                "routing.table_base leaves no room for the configured exits",
            ));
        }

        if self.rule_priority == 0 {
            return Err(ConfigError::validation(
                "routing.rule_priority must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table_base: default_table_base(),
            rule_priority: default_rule_priority(),
        }
    }
}

/// Outbound dial configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DialConfig {
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl DialConfig {
    /// Validate the dial section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "dial.connect_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Static TCP forward: every accepted connection is dialed to a fixed target
/// through the steering engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// Name used in logs
    pub name: String,

    /// Local listen address
    pub listen: SocketAddr,

    /// Target host name or address
    pub target_host: String,

    /// Target port
    pub target_port: u16,

    /// Use the client address as the sticky selection key
    #[serde(default)]
    pub sticky_by_client: bool,
}

impl ForwardConfig {
    /// Validate a forward entry
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::validation("Forward name cannot be empty"));
        }
        if self.target_host.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Forward '{}' has an empty target_host",
                self.name
            )));
        }
        if self.target_port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Forward '{}' has target_port 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate the log section
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format '{other}', expected \"json\" or \"text\""
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

const fn default_health_interval_secs() -> u64 {
    10
}

const fn default_health_timeout_secs() -> u64 {
    3
}

const fn default_recovery_threshold() -> u32 {
    3
}

fn default_probe_targets() -> Vec<SocketAddr> {
    vec![
        SocketAddr::from(([1, 1, 1, 1], 443)),
        SocketAddr::from((
            [0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111],
            443,
        )),
    ]
}

const fn default_table_base() -> u32 {
    1000
}

const fn default_rule_priority() -> u32 {
    10000
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
