//! Configuration module for exit-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use exit_router::config::{load_config, Config};
//!
//! let config = load_config("/etc/exit-router/config.json").unwrap();
//! println!("Exits: {}", config.exits.len());
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    Config, DialConfig, ExitConfig, ForwardConfig, HealthCheckConfig, LogConfig,
    PortRangeConfig, RoutingConfig, SelectorConfig, SelectorStrategy, MAX_INTERFACE_NAME_LEN,
    RESERVED_TABLE_MAX,
};
