//! Steering under concurrent connection churn

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use exit_router::config::SelectorStrategy;
use exit_router::dialer::{OutboundSocket, SteeredConnection};
use exit_router::error::{BindError, DialError};
use exit_router::selector::SelectionKey;

use super::common::{harness, ip, sink_server, Harness};

// ============================================================================
// Helpers
// ============================================================================

async fn dial_concurrently(h: &Harness, n: usize, port: u16) -> Vec<SteeredConnection> {
    let mut handles = Vec::with_capacity(n);
    for _ in 0..n {
        let dialer = Arc::clone(&h.dialer);
        handles.push(tokio::spawn(async move {
            dialer.dial_for_target("127.0.0.1", port).await
        }));
    }

    let mut conns = Vec::with_capacity(n);
    for handle in handles {
        conns.push(handle.await.unwrap().unwrap());
    }
    conns
}

fn per_exit(conns: &[SteeredConnection]) -> HashMap<IpAddr, usize> {
    let mut counts = HashMap::new();
    for conn in conns {
        *counts.entry(conn.exit()).or_insert(0) += 1;
    }
    counts
}

fn assert_balanced(h: &Harness, expected_total: u64) {
    let actives: Vec<u64> = h.pool.exits().iter().map(|e| e.active_connections()).collect();
    let max = *actives.iter().max().unwrap();
    let min = *actives.iter().min().unwrap();
    assert!(max - min <= 1, "unbalanced active counts: {actives:?}");
    assert_eq!(actives.iter().sum::<u64>(), expected_total);
}

fn assert_drained(h: &Harness) {
    for exit in h.pool.exits() {
        assert_eq!(exit.active_connections(), 0, "exit {}", exit.address());
        assert_eq!(exit.pending_dials(), 0, "exit {}", exit.address());
    }
}

// ============================================================================
// Balance
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_200_concurrent_dials_balanced() {
    let h = harness(3, SelectorStrategy::RoundRobin);
    let target = sink_server().await;

    let conns = dial_concurrently(&h, 200, target.port()).await;
    assert_eq!(conns.len(), 200);
    assert_balanced(&h, 200);
    assert_eq!(per_exit(&conns).len(), 3);

    drop(conns);
    assert_drained(&h);
    assert_eq!(h.pool.stats().total_connections(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_least_connections_200_concurrent_dials_balanced() {
    let h = harness(3, SelectorStrategy::LeastConnections);
    let target = sink_server().await;

    let conns = dial_concurrently(&h, 200, target.port()).await;
    assert_balanced(&h, 200);

    for conn in conns {
        conn.finish();
    }
    assert_drained(&h);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_least_connections_fills_the_emptiest_exit() {
    let h = harness(3, SelectorStrategy::LeastConnections);
    let target = sink_server().await;

    let mut conns = dial_concurrently(&h, 30, target.port()).await;
    // Free up 5 slots on one exit; the next 5 dials must all land there
    let victim = conns[0].exit();
    let mut freed = 0;
    conns.retain(|c| {
        if freed < 5 && c.exit() == victim {
            freed += 1;
            false
        } else {
            true
        }
    });

    for _ in 0..5 {
        let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
        assert_eq!(conn.exit(), victim);
        conns.push(conn);
    }
    assert_balanced(&h, 30);
}

// ============================================================================
// Health exclusion
// ============================================================================

#[tokio::test]
async fn test_unhealthy_exit_never_chosen() {
    let h = harness(3, SelectorStrategy::RoundRobin);
    let target = sink_server().await;
    h.pool.mark_healthy(ip("10.0.0.2"), false).unwrap();

    let mut conns = Vec::new();
    for _ in 0..60 {
        let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
        assert_ne!(conn.exit(), ip("10.0.0.2"));
        conns.push(conn);
    }
    let counts = per_exit(&conns);
    assert_eq!(counts[&ip("10.0.0.1")], 30);
    assert_eq!(counts[&ip("10.0.0.3")], 30);
    assert_eq!(h.pool.get(ip("10.0.0.2")).unwrap().total_connections(), 0);
}

#[tokio::test]
async fn test_all_exits_unhealthy() {
    let h = harness(2, SelectorStrategy::DestinationBased);
    h.pool.mark_healthy(ip("10.0.0.1"), false).unwrap();
    h.pool.mark_healthy(ip("10.0.0.2"), false).unwrap();

    let err = h.dialer.dial_for_target("127.0.0.1", 80).await.unwrap_err();
    assert!(matches!(err, DialError::NoHealthyExit));
    assert_drained(&h);
}

// ============================================================================
// Stickiness
// ============================================================================

#[tokio::test]
async fn test_destination_based_sticky_key() {
    let h = harness(3, SelectorStrategy::DestinationBased);
    let target = sink_server().await;

    let key = SelectionKey::new("127.0.0.1", target.port()).with_sticky_key("client-42");
    let first = h.dialer.dial(&key).await.unwrap();
    let exit = first.exit();
    first.finish();

    for _ in 0..50 {
        let conn = h.dialer.dial(&key).await.unwrap();
        assert_eq!(conn.exit(), exit);
    }
    assert_drained(&h);
}

// ============================================================================
// Binding
// ============================================================================

#[tokio::test]
async fn test_second_mark_on_same_handle_is_rejected() {
    let h = harness(2, SelectorStrategy::RoundRobin);
    let target = sink_server().await;
    let exit_a = h.pool.get(ip("10.0.0.1")).unwrap();
    let exit_b = h.pool.get(ip("10.0.0.2")).unwrap();

    let mut socket = OutboundSocket::tcp_for(target).unwrap();
    h.routing.mark_connection(&mut socket, &exit_a).unwrap();

    let err = h.routing.mark_connection(&mut socket, &exit_b).unwrap_err();
    assert!(matches!(err, BindError::AlreadyBound(addr) if addr == ip("10.0.0.1")));
    assert_eq!(h.backend.mark_of(socket.socket()), exit_a.table_id());
    assert_eq!(h.backend.marks_applied(), 1);
}

#[tokio::test]
async fn test_steered_connection_carries_exit_mark() {
    let h = harness(3, SelectorStrategy::RoundRobin);
    let target = sink_server().await;

    let conn = h.dialer.dial_for_target("127.0.0.1", target.port()).await.unwrap();
    let rule = h.routing.rule_for(conn.exit()).unwrap();
    assert_eq!(conn.fwmark(), Some(rule.fwmark));
    assert_eq!(rule.table_id, rule.fwmark);
    assert_eq!(conn.target(), target);
}
