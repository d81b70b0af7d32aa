//! Transparent socket tests
//!
//! All tests here set `IP_TRANSPARENT` and `SO_MARK` for real and need
//! CAP_NET_ADMIN:
//!
//! ```bash
//! sudo -E cargo test --test integration_tests transparent -- --ignored
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tproxy_relay::config::{Config, DialConfig, ListenConfig};
use tproxy_relay::connection::ProxyServer;
use tproxy_relay::tproxy::{InterceptedConnection, OriginalDestinationDialer, TransparentListener};

async fn loopback_conn(claimed_client: SocketAddr, dst: SocketAddr) -> (InterceptedConnection, TcpStream) {
    let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(front.local_addr().unwrap()).await.unwrap();
    let (server, _) = front.accept().await.unwrap();
    (InterceptedConnection::with_addresses(server, claimed_client, dst), client)
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn test_listener_binds_with_transparent_options() {
    let config = ListenConfig {
        address: "127.0.0.1".parse().unwrap(),
        port: 0,
        ..ListenConfig::default()
    };
    let listener = TransparentListener::bind(&config, 123).unwrap();
    assert_ne!(listener.local_addr().port(), 0);

    listener.close().unwrap();
    assert!(listener.accept().await.is_err());
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn test_dial_binds_to_client_address() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dst = upstream.local_addr().unwrap();

    // Any address works with IP_TRANSPARENT; one on lo keeps replies routable
    let claimed: SocketAddr = "127.0.0.77:40000".parse().unwrap();
    let (conn, _client) = loopback_conn(claimed, dst).await;

    let dialer = OriginalDestinationDialer::new(&DialConfig::default());
    let outbound = dialer.dial(&conn, true).await.unwrap();
    assert_eq!(outbound.local_addr.ip(), claimed.ip());
    assert_ne!(outbound.local_addr.port(), claimed.port());

    let (_, seen) = upstream.accept().await.unwrap();
    assert_eq!(seen.ip(), claimed.ip());
}

#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN"]
async fn test_nonblocking_dial() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dst = upstream.local_addr().unwrap();
    let (conn, _client) = loopback_conn("127.0.0.1:40001".parse().unwrap(), dst).await;

    let config = DialConfig {
        nonblocking: true,
        ..DialConfig::default()
    };
    let outbound = OriginalDestinationDialer::new(&config)
        .dial(&conn, false)
        .await
        .unwrap();
    assert!(!outbound.bound_to_client);
    assert_eq!(outbound.remote_addr, dst);
}

/// Full path through a TPROXY rule.
///
/// Setup (as root):
///
/// ```bash
/// ip addr add 198.18.0.1/32 dev lo
/// ip rule add fwmark 0x1 lookup 100
/// ip route add local 0.0.0.0/0 dev lo table 100
/// iptables -t mangle -A OUTPUT -p tcp -d 198.18.0.1 --dport 18080 \
///     -m mark ! --mark 123 -j MARK --set-mark 0x1
/// iptables -t mangle -A PREROUTING -p tcp -d 198.18.0.1 --dport 18080 \
///     -m mark ! --mark 123 -j TPROXY --on-port 19000 --tproxy-mark 0x1
/// ```
#[tokio::test]
#[ignore = "requires CAP_NET_ADMIN and TPROXY routing"]
async fn test_end_to_end_through_tproxy() {
    let upstream = TcpListener::bind("198.18.0.1:18080").await.unwrap();

    let mut config = Config::default();
    config.listen.port = 19000;
    let server = Arc::new(ProxyServer::bind(config).unwrap());
    let run = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let mut client = TcpStream::connect("198.18.0.1:18080").await.unwrap();
    let client_ip = client.local_addr().unwrap().ip();

    let (mut accepted, seen) = upstream.accept().await.unwrap();
    assert_eq!(seen.ip(), client_ip);

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    accepted.write_all(b"pong").await.unwrap();
    drop(accepted);
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"pong");
    drop(client);

    server.stop().unwrap();
    assert_eq!(server.drain(Duration::from_secs(10)).await, 0);
    run.await.unwrap().unwrap();
    assert_eq!(server.stats_snapshot().total_accepted, 1);
}
