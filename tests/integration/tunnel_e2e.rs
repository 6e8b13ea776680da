//! End-to-end tests through a real tunnel endpoint
//!
//! Each test brings up a `TunnelHandle` on an ephemeral UDP port, runs the
//! interceptor on its listener, and connects from a `TestPeer` at 10.0.0.1.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use wg_forwarder::config::{RelayConfig, TunnelOptions, UpstreamTarget};
use wg_forwarder::error::AcceptError;
use wg_forwarder::interceptor::{run_accept_loop, Interceptor};
use wg_forwarder::tunnel::TunnelHandle;

use super::support::{echo_upstream, reply_upstream, unreachable_upstream, TestKeys, TestPeer};

const INTERCEPT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const INTERCEPT_PORT: u16 = 8080;
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

struct Endpoint {
    keys: TestKeys,
    tunnel: TunnelHandle,
    interceptor: Arc<Interceptor>,
    accept_task: JoinHandle<Result<(), AcceptError>>,
}

impl Endpoint {
    async fn start(upstream: UpstreamTarget, allowed: &str) -> Self {
        let keys = TestKeys::generate();
        let config = keys.tunnel_config(INTERCEPT_IP, INTERCEPT_PORT, allowed);
        let tunnel = TunnelHandle::establish(config, &TunnelOptions::default())
            .await
            .unwrap();
        let listener = tunnel.listen_tcp(INTERCEPT_PORT).await.unwrap();

        let interceptor = Arc::new(Interceptor::new(upstream, RelayConfig::default()));
        let accept_task = tokio::spawn(run_accept_loop(listener, Arc::clone(&interceptor)));

        Self {
            keys,
            tunnel,
            interceptor,
            accept_task,
        }
    }

    fn udp_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.tunnel.local_port()))
    }

    async fn peer(&self, address: Ipv4Addr) -> TestPeer {
        TestPeer::new(&self.keys, address, self.udp_addr()).await
    }

    async fn stop(self) {
        self.interceptor.shutdown().await;
        self.tunnel.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(5), self.accept_task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

#[tokio::test]
async fn test_client_receives_upstream_reply() {
    let endpoint = Endpoint::start(reply_upstream(b"hello").await, "10.0.0.1/32").await;
    let mut peer = endpoint.peer(CLIENT_IP).await;

    let conn = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT);
    assert!(peer.wait_established(conn, Duration::from_secs(10)).await);

    let received = peer
        .read_to_close(conn, Duration::from_secs(10))
        .await
        .expect("endpoint did not close the connection");
    assert_eq!(received, b"hello");

    // The endpoint learned where the peer lives
    assert_eq!(endpoint.tunnel.peer_endpoint(), Some(peer.udp_addr()));

    endpoint.stop().await;
}

#[tokio::test]
async fn test_echo_through_tunnel() {
    let endpoint = Endpoint::start(echo_upstream().await, "10.0.0.0/24").await;
    let mut peer = endpoint.peer(CLIENT_IP).await;

    let conn = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT);
    assert!(peer.wait_established(conn, Duration::from_secs(10)).await);

    // Smaller than the client receive buffer, so sending never waits on reading
    let payload: Vec<u8> = (0..48_000u32).map(|i| (i % 253) as u8).collect();
    peer.send_all(conn, &payload).await;
    let echoed = peer.read_exact(conn, payload.len()).await;
    assert!(echoed == payload, "echoed bytes differ from the payload");

    // Client FIN travels to the upstream and the pair closes
    peer.close(conn);
    assert!(peer.read_to_close(conn, Duration::from_secs(10)).await.is_some());

    endpoint.stop().await;
}

#[tokio::test]
async fn test_unreachable_upstream_closes_connection() {
    let endpoint = Endpoint::start(unreachable_upstream().await, "10.0.0.1/32").await;
    let mut peer = endpoint.peer(CLIENT_IP).await;

    for _ in 0..2 {
        let conn = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT);
        assert!(peer.wait_established(conn, Duration::from_secs(10)).await);
        let received = peer
            .read_to_close(conn, Duration::from_secs(10))
            .await
            .expect("endpoint did not close the connection");
        assert!(received.is_empty());
    }

    assert_eq!(endpoint.interceptor.stats().accepted(), 2);
    assert!(!endpoint.accept_task.is_finished());

    endpoint.stop().await;
}

#[tokio::test]
async fn test_concurrent_connections_are_isolated() {
    let endpoint = Endpoint::start(echo_upstream().await, "10.0.0.1/32").await;
    let mut peer = endpoint.peer(CLIENT_IP).await;

    let first = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT);
    let second = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT);
    assert!(peer.wait_established(first, Duration::from_secs(10)).await);
    assert!(peer.wait_established(second, Duration::from_secs(10)).await);

    peer.send_all(first, &[b'a'; 4096]).await;
    peer.send_all(second, &[b'b'; 4096]).await;

    let from_second = peer.read_exact(second, 4096).await;
    let from_first = peer.read_exact(first, 4096).await;
    assert!(from_first.iter().all(|b| *b == b'a'));
    assert!(from_second.iter().all(|b| *b == b'b'));

    endpoint.stop().await;
}

#[tokio::test]
async fn test_source_outside_allowed_range_is_dropped() {
    let endpoint = Endpoint::start(reply_upstream(b"hello").await, "10.0.0.1/32").await;
    let mut peer = endpoint.peer(Ipv4Addr::new(10, 0, 0, 9)).await;

    let conn = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT);
    assert!(!peer.wait_established(conn, Duration::from_secs(2)).await);
    assert_eq!(endpoint.interceptor.stats().accepted(), 0);

    endpoint.stop().await;
}

#[tokio::test]
async fn test_wrong_port_is_refused() {
    let endpoint = Endpoint::start(reply_upstream(b"hello").await, "10.0.0.1/32").await;
    let mut peer = endpoint.peer(CLIENT_IP).await;

    let conn = peer.tcp_connect(INTERCEPT_IP, INTERCEPT_PORT + 1);
    assert!(!peer.wait_established(conn, Duration::from_secs(5)).await);

    endpoint.stop().await;
}
