//! Beacon Core - Fundamental registry types
//!
//! This crate defines the value types shared by every Beacon component:
//! - Instance descriptors and single-field deltas
//! - Sources (who asserted a copy of an entry)
//! - Interests (predicates over instances)
//! - Change notifications and batch sentinels

pub mod error;
pub mod instance;
pub mod interest;
pub mod notification;
pub mod source;

pub use error::*;
pub use instance::*;
pub use interest::*;
pub use notification::*;
pub use source::*;
