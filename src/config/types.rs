//! Configuration types for tproxy-relay
//!
//! This module defines all configuration structures used by the relay.
//! Configuration is loaded from JSON files, every field has a default, and
//! the whole tree is validated at startup.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Routing mark expected by the policy routing rules in front of the relay.
///
/// Traffic leaving the relay carries this mark so the `ip rule` for it skips
/// the TPROXY table instead of looping back into the listener.
pub const DEFAULT_ROUTING_MARK: u32 = 123;

/// Default listen port
pub const DEFAULT_LISTEN_PORT: u16 = 9000;

/// Default idle timeout applied to every relay read and write
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5;

const MIN_BUFFER_SIZE: usize = 1024;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Outbound dial configuration
    #[serde(default)]
    pub dial: DialConfig,

    /// Relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

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
        self.listen.validate()?;
        self.dial.validate()?;
        self.relay.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// One-line description of the effective settings, for startup logs
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "listen={}, preserve_client_address={}, nonblocking={}, mark={}, idle_timeout={}s",
            self.listen.socket_addr(),
            self.dial.preserve_client_address,
            self.dial.nonblocking,
            self.dial.routing_mark,
            self.relay.idle_timeout_secs
        )
    }
}

/// Listen configuration for the TPROXY inbound
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen IP address
    #[serde(default = "default_listen_address")]
    pub address: IpAddr,

    /// Listen port (the `--on-port` of the TPROXY rule)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// How long a graceful shutdown waits for in-flight sessions
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ListenConfig {
    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "listen.port must be greater than 0".into(),
            ));
        }

        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "listen.backlog must be greater than 0".into(),
            ));
        }

        if self.backlog > i32::MAX as u32 {
            return Err(ConfigError::ValidationError(format!(
                "listen.backlog {} is too large",
                self.backlog
            )));
        }

        Ok(())
    }

    /// Full socket address to bind
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Drain timeout as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: DEFAULT_LISTEN_PORT,
            backlog: default_backlog(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Configuration of the original-destination dialer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DialConfig {
    /// Bind the outbound socket to the client's IP so the destination sees
    /// the real client as the source
    #[serde(default = "default_true")]
    pub preserve_client_address: bool,

    /// Put the outbound socket in non-blocking mode before connect
    #[serde(default)]
    pub nonblocking: bool,

    /// `SO_MARK` value for the listener and every outbound socket
    #[serde(default = "default_routing_mark")]
    pub routing_mark: u32,
}

impl DialConfig {
    /// Validate dial configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing_mark == 0 {
            return Err(ConfigError::ValidationError(
                "dial.routing_mark must be non-zero (an unmarked outbound socket is re-intercepted)"
                    .into(),
            ));
        }
        Ok(())
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            preserve_client_address: true,
            nonblocking: false,
            routing_mark: DEFAULT_ROUTING_MARK,
        }
    }
}

/// Relay session configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Idle timeout in seconds for each read and write
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Copy buffer size per direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl RelayConfig {
    /// Validate relay configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "relay.idle_timeout_secs must be greater than 0".into(),
            ));
        }

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "relay.buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }

        Ok(())
    }

    /// Idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            buffer_size: default_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
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
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "log.format must be \"json\" or \"text\", got \"{}\"",
                self.format
            )));
        }
        Ok(())
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

const fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

const fn default_backlog() -> u32 {
    1024
}

const fn default_drain_timeout_secs() -> u64 {
    30
}

const fn default_routing_mark() -> u32 {
    DEFAULT_ROUTING_MARK
}

const fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

const fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen.socket_addr(), "0.0.0.0:9000".parse().unwrap());
        assert!(config.dial.preserve_client_address);
        assert!(!config.dial.nonblocking);
        assert_eq!(config.dial.routing_mark, 123);
        assert_eq!(config.relay.idle_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_summary_reflects_overrides() {
        let mut config = Config::default();
        assert_eq!(
            config.summary(),
            "listen=0.0.0.0:9000, preserve_client_address=true, nonblocking=false, mark=123, idle_timeout=5s"
        );

        config.listen.port = 7893;
        config.dial.preserve_client_address = false;
        config.dial.nonblocking = true;
        let summary = config.summary();
        assert!(summary.contains("listen=0.0.0.0:7893"));
        assert!(summary.contains("preserve_client_address=false"));
        assert!(summary.contains("nonblocking=true"));
    }

    #[test]
    fn test_listen_config_validation() {
        let mut config = ListenConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = ListenConfig::default();
        config.backlog = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_routing_mark_rejected() {
        let config = DialConfig {
            routing_mark: 0,
            ..DialConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("routing_mark"));
    }

    #[test]
    fn test_relay_config_validation() {
        let mut config = RelayConfig::default();
        config.idle_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.buffer_size = 16;
        assert!(config.validate().is_err());

        config.buffer_size = 2 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_validation() {
        let mut config = LogConfig::default();
        config.format = "xml".into();
        assert!(config.validate().is_err());

        config.format = "json".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "listen": { "port": 7893 }, "dial": { "nonblocking": true } }"#)
                .unwrap();
        assert_eq!(config.listen.port, 7893);
        assert_eq!(config.listen.backlog, 1024);
        assert!(config.dial.nonblocking);
        assert!(config.dial.preserve_client_address);
        assert_eq!(config.dial.routing_mark, DEFAULT_ROUTING_MARK);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"routing_mark\": 123"));
        assert!(json.contains("\"preserve_client_address\": true"));
    }
}
