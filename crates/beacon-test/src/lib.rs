//! Beacon Test Harness - In-process clusters and end-to-end scenarios
//!
//! This crate provides:
//! - A cluster of registry nodes over a shared in-memory network
//! - Partitioning and healing of node addresses
//! - Clients that register, vanish and come back on a seeded schedule
//! - Scenario tests for replication, eviction and subscriptions

pub mod cluster;
pub mod flapping;

pub use cluster::*;
pub use flapping::*;

#[cfg(test)]
mod scenarios;
