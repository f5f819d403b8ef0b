//! Beacon Registry - Multi-sourced instance registry
//!
//! This crate implements the authoritative in-memory store:
//! - Per-entry holders with one copy per source and an elected effective value
//! - Register / update / unregister with per-id atomicity
//! - Interest-indexed subscriptions with a consistent snapshot handoff
//! - Delayed eviction of vanished sources, guarded by self-preservation
//! - Status overrides layered over local registrations

pub mod eviction;
pub mod holder;
pub mod index;
pub mod overrides;
pub mod preservation;
pub mod registry;
pub mod stream;

pub use eviction::*;
pub use holder::*;
pub use index::{InterestIndex, Sequenced, SubscriptionGuard};
pub use overrides::*;
pub use preservation::*;
pub use registry::*;
pub use stream::*;
