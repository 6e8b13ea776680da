//! Interceptor and relay over loopback TCP
//!
//! The accept loop runs on a plain `TcpListener`, so these tests cover the
//! dispatch and relay behavior without the tunnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use wg_forwarder::config::{RelayConfig, UpstreamTarget};
use wg_forwarder::error::AcceptError;
use wg_forwarder::interceptor::{run_accept_loop, Interceptor};

use super::support::{echo_upstream, reply_upstream, unreachable_upstream};

struct Running {
    addr: std::net::SocketAddr,
    interceptor: Arc<Interceptor>,
    task: JoinHandle<Result<(), AcceptError>>,
}

async fn start(upstream: UpstreamTarget) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let interceptor = Arc::new(Interceptor::new(upstream, RelayConfig::default()));
    let task = tokio::spawn(run_accept_loop(listener, Arc::clone(&interceptor)));
    Running {
        addr,
        interceptor,
        task,
    }
}

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("connection was not closed in time")
        .unwrap();
    received
}

#[tokio::test]
async fn test_upstream_reply_reaches_client() {
    let running = start(reply_upstream(b"hello").await).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    assert_eq!(read_all(&mut client).await, b"hello");

    running.interceptor.shutdown().await;
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_large_payload_is_byte_exact() {
    let running = start(echo_upstream().await).await;

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let client = TcpStream::connect(running.addr).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let expected = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut echoed = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert!(echoed == expected, "echoed bytes differ from the payload");

    drop(writer_task.await.unwrap());
    running.interceptor.shutdown().await;
    running.task.await.unwrap().unwrap();
    assert_eq!(running.interceptor.stats().bytes_to_upstream(), 1_000_000);
}

#[tokio::test]
async fn test_unreachable_upstream_closes_client_and_keeps_accepting() {
    let running = start(unreachable_upstream().await).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(running.addr).await.unwrap();
        let received = read_all(&mut client).await;
        assert!(received.is_empty());
    }

    // Each relay records its failure once the dial error returns
    tokio::time::timeout(Duration::from_secs(5), async {
        while running.interceptor.stats().failed() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(running.interceptor.stats().accepted(), 3);
    assert!(!running.task.is_finished());

    running.interceptor.shutdown().await;
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_clients_are_isolated() {
    let running = start(echo_upstream().await).await;

    let mut clients = Vec::new();
    for id in 0..8u8 {
        let addr = running.addr;
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = vec![id; 32 * 1024];
            stream.write_all(&payload).await.unwrap();

            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert!(echoed.iter().all(|b| *b == id), "client {id} saw foreign bytes");
        }));
    }

    for client in clients {
        tokio::time::timeout(Duration::from_secs(10), client)
            .await
            .unwrap()
            .unwrap();
    }

    running.interceptor.shutdown().await;
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_close_reaches_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target: UpstreamTarget = upstream.local_addr().unwrap().to_string().parse().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    let running = start(target).await;
    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), upstream_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"ping");

    running.interceptor.shutdown().await;
    running.task.await.unwrap().unwrap();
}
