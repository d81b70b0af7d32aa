//! TCP connection handling
//!
//! This module provides the per-connection logic: redial the original
//! destination, then relay both directions until the session closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn, Instrument};

use super::stats::{ConnectionStats, SessionEnd};
use crate::error::TproxyError;
use crate::io::{CopyResult, RelaySession, SessionReport};
use crate::tproxy::{InterceptedConnection, OriginalDestinationDialer};

/// Context for handling a TCP connection
pub struct TcpConnectionContext {
    /// The intercepted connection
    pub conn: InterceptedConnection,

    /// Dialer for the outbound leg
    pub dialer: Arc<OriginalDestinationDialer>,

    /// Bind the outbound socket to the client's IP
    pub preserve_client_address: bool,

    /// Idle timeout for every relay read and write
    pub idle_timeout: Duration,

    /// Buffer size for each relay direction
    pub buffer_size: usize,
}

/// How a connection ended
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The original destination could not be dialed
    DialFailed(TproxyError),
    /// The relay ran and closed
    Relayed(SessionReport),
}

/// Result of handling a TCP connection
#[derive(Debug)]
pub struct TcpConnectionResult {
    /// Client address
    pub client_addr: SocketAddr,
    /// Original destination
    pub original_dst: SocketAddr,
    /// Local address of the outbound leg, if it was dialed
    pub outbound_addr: Option<SocketAddr>,
    /// How the connection ended
    pub outcome: ConnectionOutcome,
}

/// Handle an intercepted TCP connection.
///
/// This function:
/// 1. Dials the original destination
/// 2. Relays both directions until the session closes
///
/// A dial failure drops the intercepted connection, which resets the client.
pub async fn handle_tcp_connection(ctx: TcpConnectionContext) -> TcpConnectionResult {
    let TcpConnectionContext {
        conn,
        dialer,
        preserve_client_address,
        idle_timeout,
        buffer_size,
    } = ctx;

    let client_addr = conn.client_addr();
    let original_dst = conn.original_dst();

    info!("New connection: {} -> {}", client_addr, original_dst);

    let outbound = match dialer.dial(&conn, preserve_client_address).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!(
                "Failed to dial {} for {} ({}): {}",
                original_dst,
                client_addr,
                e.category(),
                e
            );
            return TcpConnectionResult {
                client_addr,
                original_dst,
                outbound_addr: None,
                outcome: ConnectionOutcome::DialFailed(e),
            };
        }
    };

    let outbound_addr = outbound.local_addr;
    info!(
        "Relaying {} <-> {} via {} (bound_to_client={}, dialed in {}ms)",
        client_addr,
        original_dst,
        outbound_addr,
        outbound.bound_to_client,
        conn.age().as_millis()
    );

    let report = RelaySession::new(conn.into_stream(), outbound.into_stream(), idle_timeout)
        .with_buffer_size(buffer_size)
        .run()
        .await;

    let bytes = report.copy_result();
    info!(
        "Connection closed: {} -> {}, {} up / {} down bytes in {}ms",
        client_addr,
        original_dst,
        bytes.client_to_upstream,
        bytes.upstream_to_client,
        report.duration.as_millis()
    );

    TcpConnectionResult {
        client_addr,
        original_dst,
        outbound_addr: Some(outbound_addr),
        outcome: ConnectionOutcome::Relayed(report),
    }
}

/// Records the end of an accepted connection exactly once.
///
/// Dropped without [`SessionGuard::finish`], for example while unwinding
/// from a panic, it records the connection as errored.
struct SessionGuard {
    stats: Arc<ConnectionStats>,
    end: Option<(SessionEnd, CopyResult)>,
}

impl SessionGuard {
    fn new(stats: Arc<ConnectionStats>) -> Self {
        Self { stats, end: None }
    }

    fn finish(mut self, end: SessionEnd, bytes: CopyResult) {
        self.end = Some((end, bytes));
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let (end, bytes) = self
            .end
            .take()
            .unwrap_or((SessionEnd::Errored, CopyResult::default()));
        self.stats.record_end(end, bytes);
    }
}

/// Spawn a task to handle a TCP connection with proper instrumentation
///
/// The connection must already be recorded as accepted in `stats`.
pub fn spawn_tcp_handler(
    ctx: TcpConnectionContext,
    stats: Arc<ConnectionStats>,
) -> tokio::task::JoinHandle<()> {
    let span = tracing::info_span!(
        "tcp_connection",
        client = %ctx.conn.client_addr(),
        dst = %ctx.conn.original_dst(),
    );
    let guard = SessionGuard::new(stats);

    tokio::spawn(
        async move {
            let result = handle_tcp_connection(ctx).await;

            let (end, bytes) = match result.outcome {
                ConnectionOutcome::DialFailed(_) => (SessionEnd::DialFailed, CopyResult::default()),
                ConnectionOutcome::Relayed(report) if report.is_clean() => {
                    (SessionEnd::Completed, report.copy_result())
                }
                ConnectionOutcome::Relayed(report) => (SessionEnd::Errored, report.copy_result()),
            };
            guard.finish(end, bytes);
        }
        .instrument(span),
    )
}
