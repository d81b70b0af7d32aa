//! Connection handling module
//!
//! This module provides connection management, including:
//! - The proxy server and its accept loop
//! - Per-connection dial and relay
//! - Statistics collection
//! - Graceful shutdown

mod server;
mod stats;
mod tcp;

pub use server::ProxyServer;
pub use stats::{ConnectionStats, SessionEnd, StatsSnapshot};
pub use tcp::{
    handle_tcp_connection, spawn_tcp_handler, ConnectionOutcome, TcpConnectionContext,
    TcpConnectionResult,
};
