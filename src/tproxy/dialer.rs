//! Original-destination dialer
//!
//! Opens the outbound leg of an intercepted connection. The outbound socket
//! is marked so policy routing does not hand it back to the TPROXY rule, made
//! transparent, and optionally bound to the client's IP so the destination
//! sees the real client as the source.
//!
//! Socket setup and connect run on the blocking pool: with the default
//! blocking mode the connect call sleeps until the handshake completes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{SockAddr, Socket};
use tokio::net::TcpStream;
use tracing::debug;

use super::addr::{family_for, to_socket_addr, AddressFamily};
use super::connection::InterceptedConnection;
use super::socket::{default_socket_ops, SocketOps};
use crate::config::DialConfig;
use crate::error::TproxyError;

/// Dials the original destination of intercepted connections
pub struct OriginalDestinationDialer {
    mark: u32,
    nonblocking: bool,
    ops: Arc<dyn SocketOps>,
}

impl fmt::Debug for OriginalDestinationDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginalDestinationDialer")
            .field("mark", &self.mark)
            .field("nonblocking", &self.nonblocking)
            .finish_non_exhaustive()
    }
}

/// An established outbound connection to an original destination
#[derive(Debug)]
pub struct OutboundConnection {
    /// Connected stream
    pub stream: TcpStream,
    /// Local address of the outbound socket, as the destination sees it
    pub local_addr: SocketAddr,
    /// The original destination
    pub remote_addr: SocketAddr,
    /// Whether the socket was bound to the client's IP
    pub bound_to_client: bool,
}

impl OutboundConnection {
    /// Consume and return the stream
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

struct DialPlan {
    family: AddressFamily,
    mark: u32,
    nonblocking: bool,
    bind: Option<(SocketAddr, SockAddr)>,
    dst: SocketAddr,
    dst_sock: SockAddr,
}

impl OriginalDestinationDialer {
    /// Create a dialer issuing real syscalls.
    #[must_use]
    pub fn new(config: &DialConfig) -> Self {
        Self::with_ops(config, default_socket_ops())
    }

    /// Create a dialer using the given socket ops.
    #[must_use]
    pub fn with_ops(config: &DialConfig, ops: Arc<dyn SocketOps>) -> Self {
        Self {
            mark: config.routing_mark,
            nonblocking: config.nonblocking,
            ops,
        }
    }

    /// `SO_MARK` applied to outbound sockets
    #[must_use]
    pub const fn mark(&self) -> u32 {
        self.mark
    }

    /// Connect to `conn`'s original destination on a fresh socket.
    ///
    /// When `preserve_client_address` is set the socket is bound to the
    /// client's IP with an ephemeral port before connecting.
    ///
    /// # Errors
    ///
    /// - `UnsupportedFamily` if either address is not IPv4
    /// - `SocketCreation`, `SocketOption`, `PermissionDenied` or `BindError`
    ///   if the socket cannot be set up
    /// - `ConnectError` if the destination cannot be reached
    pub async fn dial(
        &self,
        conn: &InterceptedConnection,
        preserve_client_address: bool,
    ) -> Result<OutboundConnection, TproxyError> {
        let dst = conn.original_dst();
        let dst_sock = to_socket_addr(dst)?;

        let bind_addr = SocketAddr::new(conn.client_addr().ip(), 0);
        let bind_sock = to_socket_addr(bind_addr)?;

        let plan = DialPlan {
            family: family_for("tcp", Some(bind_addr), Some(dst)),
            mark: self.mark,
            nonblocking: self.nonblocking,
            bind: preserve_client_address.then_some((bind_addr, bind_sock)),
            dst,
            dst_sock,
        };

        let ops = Arc::clone(&self.ops);
        let (socket, in_progress) = tokio::task::spawn_blocking(move || connect_socket(&*ops, &plan))
            .await
            .map_err(|e| TproxyError::SocketCreation(format!("dial task failed: {e}")))??;

        socket
            .set_nonblocking(true)
            .map_err(|e| TproxyError::from_option_error("O_NONBLOCK", &e))?;

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;

        if in_progress {
            stream
                .writable()
                .await
                .map_err(|e| TproxyError::connect(dst, e.to_string()))?;
            if let Some(e) = stream.take_error()? {
                return Err(TproxyError::connect(dst, e.to_string()));
            }
        }

        let local_addr = stream
            .local_addr()
            .map_err(|e| TproxyError::connect(dst, e.to_string()))?;

        debug!(
            "Dialed {} from {} (mark={}, bound_to_client={})",
            dst, local_addr, self.mark, preserve_client_address
        );

        Ok(OutboundConnection {
            stream,
            local_addr,
            remote_addr: dst,
            bound_to_client: preserve_client_address,
        })
    }
}

/// Build and connect the outbound socket. Returns whether the connect is
/// still in progress.
///
/// On error the socket is dropped here, closing the descriptor.
fn connect_socket(ops: &dyn SocketOps, plan: &DialPlan) -> Result<(Socket, bool), TproxyError> {
    let socket = ops
        .open_stream(plan.family)
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

    ops.set_mark(&socket, plan.mark)
        .map_err(|e| TproxyError::from_option_error("SO_MARK", &e))?;

    ops.set_reuse_address(&socket)
        .map_err(|e| TproxyError::from_option_error("SO_REUSEADDR", &e))?;

    ops.set_transparent(&socket)
        .map_err(|e| TproxyError::from_option_error("IP_TRANSPARENT", &e))?;

    ops.set_nonblocking(&socket, plan.nonblocking)
        .map_err(|e| TproxyError::from_option_error("O_NONBLOCK", &e))?;

    if let Some((bind_addr, bind_sock)) = &plan.bind {
        ops.bind(&socket, bind_sock).map_err(|e| {
            if e.raw_os_error() == Some(libc::EPERM) {
                TproxyError::PermissionDenied {
                    option: "bind".into(),
                }
            } else {
                TproxyError::bind(*bind_addr, e.to_string())
            }
        })?;
    }

    match ops.connect(&socket, &plan.dst_sock) {
        Ok(()) => Ok((socket, false)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((socket, true)),
        Err(e) => Err(TproxyError::connect(plan.dst, e.to_string())),
    }
}
