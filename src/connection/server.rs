//! Proxy server
//!
//! This module ties the relay together:
//! - Accept loop over the transparent listener
//! - One handler task per intercepted connection
//! - Stop and drain for graceful shutdown
//! - Statistics collection

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::stats::{ConnectionStats, StatsSnapshot};
use super::tcp::{spawn_tcp_handler, TcpConnectionContext};
use crate::config::Config;
use crate::error::{RouterError, TproxyError};
use crate::tproxy::{
    default_socket_ops, is_local_address, InterceptedConnection, OriginalDestinationDialer,
    SocketOps, TransparentListener,
};

/// Pause after a recoverable accept error so fd exhaustion does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Interval between active-session checks while draining
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Transparent relay server
#[derive(Debug)]
pub struct ProxyServer {
    config: Config,
    listener: Arc<TransparentListener>,
    dialer: Arc<OriginalDestinationDialer>,
    stats: Arc<ConnectionStats>,
}

impl ProxyServer {
    /// Bind the transparent listener and set up the dialer.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError` if the listener cannot be created.
    pub fn bind(config: Config) -> Result<Self, TproxyError> {
        Self::with_socket_ops(config, default_socket_ops())
    }

    /// Bind using the given socket ops for both listener and dialer.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError` if the listener cannot be created.
    pub fn with_socket_ops(config: Config, ops: Arc<dyn SocketOps>) -> Result<Self, TproxyError> {
        let listener = TransparentListener::bind_with(&config.listen, config.dial.routing_mark, &ops)?;
        let dialer = OriginalDestinationDialer::with_ops(&config.dial, ops);

        Ok(Self {
            config,
            listener: Arc::new(listener),
            dialer: Arc::new(dialer),
            stats: Arc::new(ConnectionStats::new()),
        })
    }

    /// Run the accept loop until the listener is closed.
    ///
    /// Each connection is handled in its own task.
    ///
    /// # Errors
    ///
    /// Returns the accept error if the listener fails with a non-recoverable
    /// error.
    pub async fn run(&self) -> Result<(), RouterError> {
        self.serve(|| self.listener.accept()).await
    }

    /// Accept loop over any source of intercepted connections
    async fn serve<F, Fut>(&self, mut next: F) -> Result<(), RouterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<InterceptedConnection, TproxyError>>,
    {
        info!(
            "Starting accept loop on {} (preserve_client_address={}, nonblocking={}, mark={})",
            self.local_addr(),
            self.config.dial.preserve_client_address,
            self.config.dial.nonblocking,
            self.config.dial.routing_mark
        );

        loop {
            match next().await {
                Ok(conn) => self.dispatch(conn),
                Err(TproxyError::ListenerClosed) => {
                    info!("Accept loop stopped: listener closed");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Recoverable accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(e) => {
                    error!("Fatal accept error on {}: {}", self.local_addr(), e);
                    return Err(e.into());
                }
            }
        }
    }

    fn dispatch(&self, conn: InterceptedConnection) {
        if is_self_addressed(conn.original_dst(), self.local_addr()) {
            self.stats.record_rejected();
            warn!(
                "Connection from {} was addressed to the listener itself ({}); \
                 not redirected by TPROXY, dropping",
                conn.client_addr(),
                conn.original_dst()
            );
            return;
        }

        self.stats.record_accepted();
        debug!(
            "Accepted connection from {} (active: {})",
            conn.client_addr(),
            self.stats.active()
        );

        let ctx = TcpConnectionContext {
            conn,
            dialer: Arc::clone(&self.dialer),
            preserve_client_address: self.config.dial.preserve_client_address,
            idle_timeout: self.config.relay.idle_timeout(),
            buffer_size: self.config.relay.buffer_size,
        };

        spawn_tcp_handler(ctx, Arc::clone(&self.stats));
    }

    /// Stop accepting connections.
    ///
    /// In-flight sessions keep running; see [`ProxyServer::drain`].
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::ListenerClosed` if already stopped.
    pub fn stop(&self) -> Result<(), TproxyError> {
        self.listener.close()
    }

    /// Wait for in-flight sessions to finish, up to `timeout`.
    ///
    /// Returns the number of sessions still active.
    pub async fn drain(&self, timeout: Duration) -> u64 {
        let drain_start = Instant::now();

        while drain_start.elapsed() < timeout {
            let active = self.stats.active();
            if active == 0 {
                info!("All connections drained");
                return 0;
            }

            debug!(
                "Waiting for {} connections to drain ({:.1}s remaining)",
                active,
                timeout.saturating_sub(drain_start.elapsed()).as_secs_f64()
            );

            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
        }

        let remaining = self.stats.active();
        if remaining > 0 {
            warn!(
                "Drain timeout reached with {} connections still active",
                remaining
            );
        }
        remaining
    }

    /// Get the listener's bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Get a snapshot of current statistics
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Get the configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

/// Whether dialing `dst` would reach this listener again. A wildcard
/// listener owns its port on every address of the host.
fn is_self_addressed(dst: SocketAddr, listen: SocketAddr) -> bool {
    if dst == listen {
        return true;
    }
    if dst.port() != listen.port() || !listen.ip().is_unspecified() {
        return false;
    }
    is_local_address(dst.ip()).unwrap_or_else(|e| {
        warn!("Cannot tell whether {} is a host address: {}", dst.ip(), e);
        true
    })
}
