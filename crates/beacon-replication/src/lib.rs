//! Beacon Replication - Keeping peer registries in sync
//!
//! This crate provides:
//! - The replication wire messages and the client registration messages
//! - `SenderReplicationChannel`: handshake, then streams local registry
//!   changes to one peer with per-message acknowledgements
//! - `ReceiverReplicationChannel`: applies a peer's copies under that
//!   peer's source, rejects replication loops, and hands a vanished peer's
//!   copies to the eviction queue
//! - `RegistrationChannel` / `RegistrationClient`: the client side of the
//!   registry, one local source per connection
//! - `ReplicationService`: one retrying sender per resolved peer address
//! - `BatchReplicationHandler`: the positional request/response batch
//!   variant of the protocol

pub mod batch;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod registration;
pub mod sender;
pub mod service;

pub use batch::*;
pub use error::*;
pub use protocol::*;
pub use receiver::*;
pub use registration::*;
pub use sender::*;
pub use service::*;
