//! Proxy server lifecycle integration tests
//!
//! These run without CAP_NET_ADMIN by plugging in socket ops that skip the
//! privileged options. Without TPROXY routing every connection reaches the
//! listener addressed to the listener itself, which the server drops.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use tproxy_relay::config::Config;
use tproxy_relay::connection::ProxyServer;
use tproxy_relay::tproxy::{AddressFamily, RealSocketOps, SocketOps};
use tproxy_relay::TproxyError;

// ============================================================================
// Test Helpers
// ============================================================================

/// Real syscalls, minus `IP_TRANSPARENT` and `SO_MARK`
struct UnprivilegedOps;

impl SocketOps for UnprivilegedOps {
    fn open_stream(&self, family: AddressFamily) -> io::Result<Socket> {
        RealSocketOps.open_stream(family)
    }

    fn set_mark(&self, _socket: &Socket, _mark: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_reuse_address(&self, socket: &Socket) -> io::Result<()> {
        RealSocketOps.set_reuse_address(socket)
    }

    fn set_transparent(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    fn set_nonblocking(&self, socket: &Socket, nonblocking: bool) -> io::Result<()> {
        RealSocketOps.set_nonblocking(socket, nonblocking)
    }

    fn bind(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        RealSocketOps.bind(socket, addr)
    }

    fn listen(&self, socket: &Socket, backlog: i32) -> io::Result<()> {
        RealSocketOps.listen(socket, backlog)
    }

    fn connect(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        RealSocketOps.connect(socket, addr)
    }
}

fn loopback_config() -> Config {
    let mut config = Config::default();
    config.listen.address = "127.0.0.1".parse().unwrap();
    config.listen.port = 0;
    config
}

fn start_server() -> (Arc<ProxyServer>, tokio::task::JoinHandle<tproxy_relay::error::Result<()>>) {
    let server = Arc::new(
        ProxyServer::with_socket_ops(loopback_config(), Arc::new(UnprivilegedOps)).unwrap(),
    );
    let run = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });
    (server, run)
}

async fn expect_closed(mut stream: TcpStream) {
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

// ============================================================================
// Accept Loop Tests
// ============================================================================

#[tokio::test]
async fn test_untransparent_connections_are_dropped() {
    let (server, run) = start_server();

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(server.local_addr()).await.unwrap());
    }
    for client in clients {
        expect_closed(client).await;
    }

    let stats = server.stats_snapshot();
    assert_eq!(stats.rejected, 5);
    assert_eq!(stats.total_accepted, 0);
    assert_eq!(stats.active, 0);

    server.stop().unwrap();
    run.await.unwrap().unwrap();
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_stop_then_second_stop() {
    let (server, run) = start_server();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(server.stop().is_ok());
    assert!(matches!(server.stop(), Err(TproxyError::ListenerClosed)));

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("accept loop did not stop")
        .unwrap();
    assert!(result.is_ok());

    let err = TcpStream::connect(server.local_addr()).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
}

#[tokio::test]
async fn test_drain_after_stop() {
    let (server, run) = start_server();

    server.stop().unwrap();
    assert_eq!(server.drain(Duration::from_secs(1)).await, 0);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_without_capability() {
    match ProxyServer::bind(loopback_config()) {
        Ok(server) => assert_ne!(server.local_addr().port(), 0),
        Err(e) => assert!(
            matches!(e, TproxyError::PermissionDenied { .. }),
            "unexpected error: {e}"
        ),
    }
}
