//! tproxy-relay: transparent TCP relay for Linux TPROXY
//!
//! This crate accepts TCP connections redirected by an iptables `TPROXY`
//! rule, recovers each connection's original destination, and reopens the
//! connection towards that destination from the client's own IP address.
//!
//! # Features
//!
//! - **Transparent listener**: `IP_TRANSPARENT` and `SO_MARK` on the
//!   listening socket
//! - **Source-preserving dial**: outbound sockets bound to the client's IP,
//!   marked so policy routing lets them out
//! - **Bounded relay**: per-direction copy tasks with an idle timeout
//! - **Graceful shutdown**: stop accepting, then drain in-flight sessions
//!
//! # Architecture
//!
//! ```text
//! Client → iptables TPROXY → TransparentListener → OriginalDestinationDialer → Destination
//!                                     ↓                          ↓
//!                               InterceptedConnection  ←  RelaySession  →  OutboundConnection
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use tproxy_relay::config::load_config;
//! use tproxy_relay::connection::ProxyServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tproxy-relay/config.json")?;
//! let server = ProxyServer::bind(config)?;
//!
//! // Runs until `server.stop()` is called from another task
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Proxy server, connection handling and statistics
//! - [`error`]: Error types
//! - [`io`]: Relay session and idle-bounded copy
//! - [`tproxy`]: TPROXY sockets, listener and dialer

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod io;
pub mod tproxy;

// Re-export commonly used types at the crate root
pub use config::{Config, DialConfig, ListenConfig, RelayConfig};
pub use connection::{ConnectionStats, ProxyServer, StatsSnapshot};
pub use error::{ConfigError, Direction, ErrorCategory, RelayError, RouterError, TproxyError};
pub use io::{CopyResult, RelaySession, SessionReport, SessionState};
pub use tproxy::{
    InterceptedConnection, OriginalDestinationDialer, OutboundConnection, TransparentListener,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with required capabilities for TPROXY
///
/// # Errors
///
/// Returns `TproxyError::PermissionDenied` if `IP_TRANSPARENT` cannot be set.
pub fn check_capabilities() -> Result<(), TproxyError> {
    if !tproxy::has_net_admin_capability() {
        return Err(TproxyError::PermissionDenied {
            option: "IP_TRANSPARENT".into(),
        });
    }
    Ok(())
}
