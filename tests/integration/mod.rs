//! Integration tests for tproxy-relay
//!
//! # Test Organization
//!
//! - `relay`: relay sessions over real loopback TCP connections
//! - `server`: proxy server lifecycle (accept loop, stop, drain)
//! - `transparent`: listener and dialer with real TPROXY socket options
//!
//! # Test Requirements
//!
//! - Most tests run on loopback without privileges
//! - Tests marked with `#[ignore]` require CAP_NET_ADMIN

pub mod relay;
pub mod server;
pub mod transparent;
