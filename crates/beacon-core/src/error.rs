//! Error types for the Beacon registry

use thiserror::Error;

/// Core Beacon errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BeaconError {
    // Model errors
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    #[error("Invalid interest pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // Registry errors
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Registry is shut down")]
    RegistryShutdown,
}

/// Result type for Beacon operations
pub type BeaconResult<T> = Result<T, BeaconError>;
