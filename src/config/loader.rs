//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::{Config, SelectorStrategy};
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        exits = config.exits.len(),
        strategy = %config.selector.strategy,
        routing = config.routing.enabled,
        forwards = config.forwards.len(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `EXIT_ROUTER_LOG_LEVEL`: Override log level
/// - `EXIT_ROUTER_SELECTOR`: Override selector strategy
/// - `EXIT_ROUTER_ROUTING_ENABLED`: Enable or disable kernel steering (`true`/`false`)
/// - `EXIT_ROUTER_HEALTH_INTERVAL`: Override health check interval in seconds
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or re-validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply overrides from a variable lookup
///
/// Split out from [`load_config_with_env`] so tests do not touch the
/// process environment.
pub(crate) fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup("EXIT_ROUTER_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(strategy) = lookup("EXIT_ROUTER_SELECTOR") {
        config.selector.strategy =
            strategy
                .parse::<SelectorStrategy>()
                .map_err(|reason| ConfigError::EnvError {
                    name: "EXIT_ROUTER_SELECTOR".into(),
                    reason,
                })?;
        debug!("Selector strategy overridden to {}", config.selector.strategy);
    }

    if let Some(enabled) = lookup("EXIT_ROUTER_ROUTING_ENABLED") {
        config.routing.enabled = parse_bool(&enabled).ok_or_else(|| ConfigError::EnvError {
            name: "EXIT_ROUTER_ROUTING_ENABLED".into(),
            reason: format!("Invalid boolean: {enabled}"),
        })?;
        debug!("Routing enabled overridden to {}", config.routing.enabled);
    }

    if let Some(interval) = lookup("EXIT_ROUTER_HEALTH_INTERVAL") {
        config.health_check.interval_secs =
            interval.parse().map_err(|_| ConfigError::EnvError {
                name: "EXIT_ROUTER_HEALTH_INTERVAL".into(),
                reason: format!("Invalid number: {interval}"),
            })?;
        debug!(
            "Health check interval overridden to {}s",
            config.health_check.interval_secs
        );
    }

    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
