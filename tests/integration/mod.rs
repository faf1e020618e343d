//! Integration tests for exit-router
//!
//! Every test drives the public API end to end against the in-memory routing
//! backend and loopback listeners, so no privileges or network are needed.
//!
//! # Test Organization
//!
//! - `common`: shared fixtures (pool, routing, dialer, echo server)
//! - `steering`: concurrent dials, balance and counter accounting
//! - `routing_lifecycle`: setup idempotence, partial failure, cleanup ledger
//! - `health_failover`: scripted probes driving demotion and recovery
//! - `forward`: static forward relaying through the dialer

pub mod common;
pub mod forward;
pub mod health_failover;
pub mod routing_lifecycle;
pub mod steering;
