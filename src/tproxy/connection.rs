//! Intercepted connections
//!
//! Under TPROXY the kernel delivers a redirected connection with its
//! addresses untouched: the socket's local address is the destination the
//! client dialed and its peer address is the client itself.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::TproxyError;

/// An accepted connection together with its original endpoints
#[derive(Debug)]
pub struct InterceptedConnection {
    stream: TcpStream,
    /// Peer address of the accepted socket
    client_addr: SocketAddr,
    /// Local address of the accepted socket
    original_dst: SocketAddr,
    accepted_at: Instant,
}

impl InterceptedConnection {
    /// Wrap an accepted stream, reading the original destination from its
    /// local address.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::IoError` if the local address cannot be read.
    pub fn from_stream(stream: TcpStream, client_addr: SocketAddr) -> Result<Self, TproxyError> {
        let original_dst = stream.local_addr()?;
        debug!("Intercepted {} -> {}", client_addr, original_dst);
        Ok(Self::with_addresses(stream, client_addr, original_dst))
    }

    /// Wrap a stream whose endpoints are already known.
    pub fn with_addresses(
        stream: TcpStream,
        client_addr: SocketAddr,
        original_dst: SocketAddr,
    ) -> Self {
        Self {
            stream,
            client_addr,
            original_dst,
            accepted_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Where the connection came from
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Where the client was trying to go
    #[must_use]
    pub const fn original_dst(&self) -> SocketAddr {
        self.original_dst
    }

    /// Time since the connection was accepted
    #[must_use]
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }
}
