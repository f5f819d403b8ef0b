//! Beacon Time - Timing primitives
//!
//! This crate implements the timing building blocks shared by the registry
//! and the transport:
//! - `DirtyClock`: monotonic generator for `last_dirty_timestamp` values
//! - `DeadlineQueue`: time-ordered queue drained by a single consumer, with
//!   at most one outstanding wakeup that is moved earlier on demand

pub mod clock;
pub mod deadline;

pub use clock::*;
pub use deadline::*;
