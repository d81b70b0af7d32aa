//! Configuration module for tproxy-relay
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use tproxy_relay::config::load_config;
//!
//! let config = load_config("/etc/tproxy-relay/config.json").unwrap();
//! println!("Listening on {}", config.listen.socket_addr());
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, ENV_IDLE_TIMEOUT_SECS, ENV_LOG_LEVEL, ENV_PORT, ENV_ROUTING_MARK,
};
pub use types::{
    Config, DialConfig, ListenConfig, LogConfig, RelayConfig, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_LISTEN_PORT, DEFAULT_ROUTING_MARK,
};
