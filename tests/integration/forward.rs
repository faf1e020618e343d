//! Forward listener end to end

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use exit_router::config::{ForwardConfig, SelectorStrategy};
use exit_router::forward::ForwardListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::common::{echo_server, eventually, harness, Harness};

fn forward_config(target: SocketAddr, sticky_by_client: bool) -> ForwardConfig {
    ForwardConfig {
        name: "echo".into(),
        listen: "127.0.0.1:0".parse().unwrap(),
        target_host: target.ip().to_string(),
        target_port: target.port(),
        sticky_by_client,
    }
}

async fn start(h: &Harness, config: ForwardConfig) -> (Arc<ForwardListener>, SocketAddr) {
    let listener = Arc::new(
        ForwardListener::bind(config, Arc::clone(&h.dialer))
            .await
            .unwrap(),
    );
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&listener).run());
    (listener, addr)
}

async fn round_trip(addr: SocketAddr, payload: &[u8]) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_spreads_clients_across_exits() {
    let h = harness(3, SelectorStrategy::RoundRobin);
    let target = echo_server().await;
    let (listener, addr) = start(&h, forward_config(target, false)).await;

    for i in 0..9u8 {
        round_trip(addr, &[i; 64]).await;
    }

    assert!(
        eventually(|| h.pool.stats().active_connections() == 0).await,
        "relays did not release their exits"
    );
    for exit in h.pool.exits() {
        assert_eq!(exit.total_connections(), 3, "exit {}", exit.address());
    }

    let stats = listener.stats();
    assert_eq!(stats.accepted, 9);
    assert_eq!(stats.bytes_client_to_target, 9 * 64);
    listener.shutdown();
}

#[tokio::test]
async fn test_sticky_forward_pins_client_to_one_exit() {
    let h = harness(3, SelectorStrategy::DestinationBased);
    let target = echo_server().await;
    let (listener, addr) = start(&h, forward_config(target, true)).await;

    for _ in 0..6 {
        round_trip(addr, b"sticky").await;
    }
    assert!(eventually(|| h.pool.stats().active_connections() == 0).await);

    let used: HashSet<_> = h
        .pool
        .exits()
        .iter()
        .filter(|e| e.total_connections() > 0)
        .map(|e| e.address())
        .collect();
    assert_eq!(used.len(), 1);
    listener.shutdown();
}

#[tokio::test]
async fn test_forward_with_no_healthy_exit_drops_client() {
    let h = harness(1, SelectorStrategy::RoundRobin);
    h.pool
        .mark_healthy("10.0.0.1".parse().unwrap(), false)
        .unwrap();
    let target = echo_server().await;
    let (listener, addr) = start(&h, forward_config(target, false)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(listener.stats().dial_failures, 1);
    listener.shutdown();
}
