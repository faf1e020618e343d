//! Shared fixtures

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use exit_router::config::{DialConfig, ExitConfig, RoutingConfig, SelectorStrategy};
use exit_router::dialer::ExitDialer;
use exit_router::pool::ExitPool;
use exit_router::routing::{MemoryBackend, RoutingBackend, RoutingManager};
use exit_router::selector::IpSelector;
use tokio::net::TcpListener;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Pool of `n` IPv4 exits 10.0.0.1..=10.0.0.n on eth0
pub fn pool(n: u8) -> Arc<ExitPool> {
    let exits: Vec<ExitConfig> = (1..=n)
        .map(|i| ExitConfig::new(ip(&format!("10.0.0.{i}")), "eth0", ip("10.0.0.254")))
        .collect();
    Arc::new(ExitPool::from_config(&exits))
}

pub struct Harness {
    pub pool: Arc<ExitPool>,
    pub backend: Arc<MemoryBackend>,
    pub routing: Arc<RoutingManager>,
    pub dialer: Arc<ExitDialer>,
}

/// Pool, provisioned in-memory routing and a dialer
pub fn harness(exits: u8, strategy: SelectorStrategy) -> Harness {
    let pool = pool(exits);
    let backend = Arc::new(MemoryBackend::new());
    let routing = Arc::new(
        RoutingManager::new(
            &RoutingConfig::default(),
            Arc::clone(&backend) as Arc<dyn RoutingBackend>,
        )
        .unwrap(),
    );
    routing.setup(&pool).unwrap();

    let dialer = Arc::new(
        ExitDialer::new(
            Arc::clone(&pool),
            Arc::new(IpSelector::new(strategy)),
            Arc::clone(&routing),
            &DialConfig::default(),
        )
        .with_connect_timeout(Duration::from_secs(5)),
    );

    Harness {
        pool,
        backend,
        routing,
        dialer,
    }
}

/// Accepts and holds connections open until the peer closes
pub async fn sink_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    addr
}

/// Echoes everything back
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Poll `cond` for up to two seconds
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
