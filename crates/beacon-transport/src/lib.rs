//! Beacon Transport - Acknowledged message channels
//!
//! This crate provides:
//! - `MessageConnection`: ordered point-to-point messages with optional
//!   correlated acknowledgements and ack timeouts
//! - A lifecycle signal that completes when the connection ends
//! - `Connector` / `Listener` contracts and an in-memory network used by
//!   nodes and tests

pub mod connection;
pub mod error;
pub mod memory;

pub use connection::*;
pub use error::*;
pub use memory::*;
