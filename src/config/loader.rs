//! Configuration loading
//!
//! Configuration comes from a JSON file, then `TPROXY_RELAY_*` environment
//! variables, then command-line flags (applied by the binary). Each layer is
//! validated after it is applied.

use std::io;
use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Environment variable overriding `listen.port`
pub const ENV_PORT: &str = "TPROXY_RELAY_PORT";
/// Environment variable overriding `log.level`
pub const ENV_LOG_LEVEL: &str = "TPROXY_RELAY_LOG_LEVEL";
/// Environment variable overriding `dial.routing_mark`
pub const ENV_ROUTING_MARK: &str = "TPROXY_RELAY_ROUTING_MARK";
/// Environment variable overriding `relay.idle_timeout_secs`
pub const ENV_IDLE_TIMEOUT_SECS: &str = "TPROXY_RELAY_IDLE_TIMEOUT_SECS";

/// Load and validate a JSON configuration file
///
/// # Errors
///
/// `FileNotFound` if `path` does not exist, otherwise any read, parse or
/// validation error.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!("Reading configuration {}", path.display());

    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.display().to_string(),
        },
        _ => ConfigError::IoError(e),
    })?;

    let config = parse(&contents).map_err(|e| match e {
        ConfigError::ParseError(reason) => {
            ConfigError::ParseError(format!("{}: {reason}", path.display()))
        }
        other => other,
    })?;

    debug!("Configuration {}: {}", path.display(), config.summary());
    Ok(config)
}

/// Parse and validate configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    parse(json)
}

fn parse(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// [`load_config`] followed by [`apply_env_overrides`]
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Apply `TPROXY_RELAY_*` environment overrides to `config`
///
/// | Variable | Field |
/// |---|---|
/// | `TPROXY_RELAY_PORT` | `listen.port` |
/// | `TPROXY_RELAY_LOG_LEVEL` | `log.level` |
/// | `TPROXY_RELAY_ROUTING_MARK` | `dial.routing_mark` |
/// | `TPROXY_RELAY_IDLE_TIMEOUT_SECS` | `relay.idle_timeout_secs` |
///
/// # Errors
///
/// `EnvError` for a value that does not parse, `ValidationError` if the
/// resulting configuration is invalid.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

fn apply_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let parsed = |name: &str| -> Result<Option<u64>, ConfigError> {
        lookup(name)
            .map(|value| {
                value.trim().parse::<u64>().map_err(|_| ConfigError::EnvError {
                    name: name.into(),
                    reason: format!("Invalid value: {value}"),
                })
            })
            .transpose()
    };
    let narrow = |name: &str, value: u64| ConfigError::EnvError {
        name: name.into(),
        reason: format!("Out of range: {value}"),
    };

    if let Some(port) = parsed(ENV_PORT)? {
        config.listen.port = u16::try_from(port).map_err(|_| narrow(ENV_PORT, port))?;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
    }
    if let Some(mark) = parsed(ENV_ROUTING_MARK)? {
        config.dial.routing_mark =
            u32::try_from(mark).map_err(|_| narrow(ENV_ROUTING_MARK, mark))?;
    }
    if let Some(secs) = parsed(ENV_IDLE_TIMEOUT_SECS)? {
        config.relay.idle_timeout_secs = secs;
    }

    config.validate()
}

/// Write the default configuration as pretty JSON to `path`
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(&Config::default())
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}
