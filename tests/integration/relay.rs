//! Relay session integration tests
//!
//! Sessions run over real loopback TCP connections:
//!
//! ```text
//! client_peer <-> client_side =[RelaySession]= upstream_side <-> upstream_peer
//! ```

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tproxy_relay::io::{RelaySession, SessionReport, SessionState};
use tproxy_relay::Direction;

// ============================================================================
// Test Helpers
// ============================================================================

/// A connected loopback TCP pair
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connect = TcpStream::connect(listener.local_addr().unwrap());
    let (accepted, connected) = tokio::join!(listener.accept(), connect);
    (connected.unwrap(), accepted.unwrap().0)
}

struct Harness {
    client_peer: TcpStream,
    upstream_peer: TcpStream,
    session: tokio::task::JoinHandle<SessionReport>,
    state: tokio::sync::watch::Receiver<SessionState>,
}

async fn start_session(idle: Duration) -> Harness {
    let (client_peer, client_side) = tcp_pair().await;
    let (upstream_side, upstream_peer) = tcp_pair().await;

    let session = RelaySession::new(client_side, upstream_side, idle);
    let state = session.subscribe();

    Harness {
        client_peer,
        upstream_peer,
        session: tokio::spawn(session.run()),
        state,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    buf
}

// ============================================================================
// Byte Delivery Tests
// ============================================================================

#[tokio::test]
async fn test_client_closes_first() {
    let mut h = start_session(Duration::from_secs(5)).await;
    let request = pattern(3000, 1);
    let response = pattern(7000, 2);

    h.client_peer.write_all(&request).await.unwrap();
    h.client_peer.shutdown().await.unwrap();
    assert_eq!(read_all(&mut h.upstream_peer).await, request);

    h.upstream_peer.write_all(&response).await.unwrap();
    h.upstream_peer.shutdown().await.unwrap();
    assert_eq!(read_all(&mut h.client_peer).await, response);

    let report = h.session.await.unwrap();
    assert!(report.is_clean());
    let bytes = report.into_result().unwrap();
    assert_eq!(bytes.client_to_upstream, 3000);
    assert_eq!(bytes.upstream_to_client, 7000);
}

#[tokio::test]
async fn test_upstream_closes_first() {
    let mut h = start_session(Duration::from_secs(5)).await;
    let request = pattern(10, 3);
    let response = pattern(20_000, 4);

    h.upstream_peer.write_all(&response).await.unwrap();
    h.upstream_peer.shutdown().await.unwrap();
    assert_eq!(read_all(&mut h.client_peer).await, response);

    h.client_peer.write_all(&request).await.unwrap();
    h.client_peer.shutdown().await.unwrap();
    assert_eq!(read_all(&mut h.upstream_peer).await, request);

    let bytes = h.session.await.unwrap().into_result().unwrap();
    assert_eq!(bytes.client_to_upstream, 10);
    assert_eq!(bytes.upstream_to_client, 20_000);
    assert_eq!(bytes.total(), 20_010);
}

#[tokio::test]
async fn test_large_transfer_both_ways() {
    let h = start_session(Duration::from_secs(5)).await;
    let up = pattern(1024 * 1024, 5);
    let down = pattern(2 * 1024 * 1024 + 17, 6);

    let (mut client_read, mut client_write) = h.client_peer.into_split();
    let (mut upstream_read, mut upstream_write) = h.upstream_peer.into_split();

    let up_sent = up.clone();
    let down_sent = down.clone();
    let (_, _, client_received, upstream_received) = tokio::join!(
        async move {
            client_write.write_all(&up_sent).await.unwrap();
            client_write.shutdown().await.unwrap();
        },
        async move {
            upstream_write.write_all(&down_sent).await.unwrap();
            upstream_write.shutdown().await.unwrap();
        },
        async move {
            let mut buf = Vec::new();
            client_read.read_to_end(&mut buf).await.unwrap();
            buf
        },
        async move {
            let mut buf = Vec::new();
            upstream_read.read_to_end(&mut buf).await.unwrap();
            buf
        },
    );

    assert_eq!(upstream_received, up);
    assert_eq!(client_received, down);

    let bytes = h.session.await.unwrap().into_result().unwrap();
    assert_eq!(bytes.client_to_upstream, up.len() as u64);
    assert_eq!(bytes.upstream_to_client, down.len() as u64);
}

// ============================================================================
// Timeout Tests
// ============================================================================

#[tokio::test]
async fn test_stalled_direction_times_out_other_completes() {
    let idle = Duration::from_millis(300);
    let mut h = start_session(idle).await;
    let started = Instant::now();

    // The client never sends and never closes; upstream keeps streaming
    // for longer than the idle timeout.
    let mut upstream_peer = h.upstream_peer;
    let producer = tokio::spawn(async move {
        for i in 0..6u8 {
            upstream_peer.write_all(&[i; 256]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        upstream_peer.shutdown().await.unwrap();
        upstream_peer
    });

    let received = read_all(&mut h.client_peer).await;
    assert_eq!(received.len(), 6 * 256);

    let report = h.session.await.unwrap();
    let elapsed = started.elapsed();
    producer.await.unwrap();

    let c2u = report.client_to_upstream.error.as_ref().unwrap();
    assert!(c2u.is_timeout());
    assert_eq!(c2u.direction(), Direction::ClientToUpstream);
    assert!(report.upstream_to_client.is_ok());
    assert_eq!(report.upstream_to_client.bytes, 6 * 256);

    // Bounded by the longer of the idle timeout and the other direction
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(3), "session took {elapsed:?}");
}

#[tokio::test]
async fn test_silent_session_closes_both_streams() {
    let mut h = start_session(Duration::from_millis(200)).await;

    let report = tokio::time::timeout(Duration::from_secs(3), h.session)
        .await
        .expect("silent session did not time out")
        .unwrap();

    assert_eq!(report.errors().count(), 2);
    assert!(report.errors().all(|e| e.is_timeout()));
    assert!(report.into_result().is_err());

    // Both outer peers observe the close
    assert!(read_all(&mut h.client_peer).await.is_empty());
    assert!(read_all(&mut h.upstream_peer).await.is_empty());
    assert_eq!(*h.state.borrow(), SessionState::Closed);
}

// ============================================================================
// Close Behaviour Tests
// ============================================================================

#[tokio::test]
async fn test_peer_reset_is_reported_and_session_closes() {
    let mut h = start_session(Duration::from_secs(2)).await;

    // Upstream vanishes with unread data, which resets its side
    h.client_peer.write_all(b"request").await.unwrap();
    h.upstream_peer.set_linger(Some(Duration::ZERO)).unwrap();
    drop(h.upstream_peer);

    let report = tokio::time::timeout(Duration::from_secs(5), h.session)
        .await
        .expect("session did not finish after upstream reset")
        .unwrap();

    // The client never closed, so at least its direction ended early
    assert!(!report.is_clean());
    assert_eq!(report.copy_result().upstream_to_client, 0);

    let mut buf = [0u8; 16];
    let n = h.client_peer.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_state_reaches_closed() {
    let mut h = start_session(Duration::from_secs(5)).await;

    h.client_peer.shutdown().await.unwrap();
    h.upstream_peer.shutdown().await.unwrap();

    h.state
        .wait_for(|s| *s == SessionState::Closed)
        .await
        .unwrap();
    let report = h.session.await.unwrap();
    assert_eq!(report.copy_result().total(), 0);
}
