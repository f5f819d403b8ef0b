//! Beacon Runtime - Registry node composition
//!
//! This crate wires the subsystems into a running node:
//! - `NodeConfig`: defaults, JSON file form and environment overrides
//! - `RegistryNode`: registry, eviction, status overrides, replication
//!   service and the replication / registration accept loops
//! - The query surface used by outer layers (register, renew, status
//!   overrides, lookups by id and VIP)
//! - Tracing subscriber initialisation

pub mod config;
pub mod node;
pub mod telemetry;

pub use config::*;
pub use node::*;
pub use telemetry::*;
