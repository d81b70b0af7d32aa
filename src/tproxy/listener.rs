//! TPROXY TCP Listener
//!
//! This module provides a listener for accepting TPROXY-redirected TCP
//! connections. The socket is bound and listening before `IP_TRANSPARENT` and
//! `SO_MARK` are applied to the same descriptor.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::addr::{to_socket_addr, AddressFamily};
use super::connection::InterceptedConnection;
use super::socket::{default_socket_ops, ip_transparent_enabled, SocketOps};
use crate::config::ListenConfig;
use crate::error::TproxyError;

/// A TPROXY TCP listener that yields intercepted connections
#[derive(Debug)]
pub struct TransparentListener {
    /// The bound socket; taken and dropped by `close()`
    listener: Mutex<Option<Arc<TcpListener>>>,

    /// Bound address
    local_addr: SocketAddr,

    /// Set once by `close()`; pending accepts watch it
    closed: watch::Sender<bool>,
}

impl TransparentListener {
    /// Create and bind a new TPROXY listener.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError` if:
    /// - The listen address is not IPv4
    /// - Socket creation, bind or listen fails
    /// - `CAP_NET_ADMIN` capability is missing
    pub fn bind(config: &ListenConfig, mark: u32) -> Result<Self, TproxyError> {
        Self::bind_with(config, mark, &default_socket_ops())
    }

    /// Create and bind a listener through the given socket ops.
    ///
    /// # Errors
    ///
    /// See [`TransparentListener::bind`].
    pub fn bind_with(
        config: &ListenConfig,
        mark: u32,
        ops: &Arc<dyn SocketOps>,
    ) -> Result<Self, TproxyError> {
        let addr = config.socket_addr();
        info!("Creating TPROXY TCP listener on {}", addr);

        let sock_addr = to_socket_addr(addr)?;

        let socket = ops
            .open_stream(AddressFamily::Ipv4)
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

        ops.set_reuse_address(&socket)
            .map_err(|e| TproxyError::from_option_error("SO_REUSEADDR", &e))?;

        ops.bind(&socket, &sock_addr)
            .map_err(|e| TproxyError::bind(addr, e.to_string()))?;

        // Validated config keeps the backlog within i32
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        ops.listen(&socket, backlog)
            .map_err(|e| TproxyError::socket_option("listen", e.to_string()))?;

        ops.set_transparent(&socket)
            .map_err(|e| TproxyError::from_option_error("IP_TRANSPARENT", &e))?;

        match ip_transparent_enabled(&socket) {
            Ok(enabled) => debug!("IP_TRANSPARENT on listener {}: {}", addr, enabled),
            Err(e) => warn!("Failed to read back IP_TRANSPARENT on {}: {}", addr, e),
        }

        ops.set_mark(&socket, mark)
            .map_err(|e| TproxyError::from_option_error("SO_MARK", &e))?;

        ops.set_nonblocking(&socket, true)
            .map_err(|e| TproxyError::from_option_error("O_NONBLOCK", &e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

        let local_addr = listener.local_addr()?;

        info!(
            "TPROXY TCP listener ready on {} (backlog={}, mark={})",
            local_addr, config.backlog, mark
        );

        let (closed, _) = watch::channel(false);

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            closed,
        })
    }

    /// Accept a new intercepted connection.
    ///
    /// Waits until a connection arrives or the listener is closed.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::ListenerClosed` once `close()` has been called,
    /// or `TproxyError::AcceptError` if the OS accept fails.
    pub async fn accept(&self) -> Result<InterceptedConnection, TproxyError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TproxyError::ListenerClosed);
        }
        let Some(listener) = self.listener.lock().clone() else {
            return Err(TproxyError::ListenerClosed);
        };

        tokio::select! {
            biased;

            () = wait_closed(closed) => Err(TproxyError::ListenerClosed),

            res = listener.accept() => {
                let (stream, client_addr) = res.map_err(TproxyError::AcceptError)?;
                debug!("Accepted connection from {}", client_addr);
                InterceptedConnection::from_stream(stream, client_addr)
            }
        }
    }

    /// Close the listener.
    ///
    /// The socket stops listening: new clients are refused by the kernel.
    /// Pending and future `accept` calls fail with `ListenerClosed`; a pending
    /// accept holds the socket only until it wakes.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::ListenerClosed` if already closed.
    pub fn close(&self) -> Result<(), TproxyError> {
        if self.closed.send_replace(true) {
            return Err(TproxyError::ListenerClosed);
        }
        drop(self.listener.lock().take());
        info!("TPROXY listener on {} closed", self.local_addr);
        Ok(())
    }

    /// Check if `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Get the bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}
