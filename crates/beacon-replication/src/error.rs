//! Replication errors

use thiserror::Error;

use beacon_core::BeaconError;
use beacon_transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] BeaconError),

    // Protocol anomalies
    #[error("Replication loop: peer replicates {own_id}'s own data back to it")]
    ReplicationLoop { own_id: String },

    #[error("Connected to self")]
    SelfConnection,

    #[error("Unexpected message in state {state}: {message}")]
    UnexpectedMessage { state: &'static str, message: String },

    #[error("Handshake already completed")]
    HandshakeAlreadyDone,

    // Lifecycle
    #[error("No handshake reply within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("No heartbeat within {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("Replication channel closed")]
    ChannelClosed,
}

impl ReplicationError {
    /// Failures the owning service recovers from by reconnecting
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicationError::Transport(e) => e.is_transient(),
            ReplicationError::HandshakeTimeout(_)
            | ReplicationError::HeartbeatTimeout(_)
            | ReplicationError::ChannelClosed => true,
            _ => false,
        }
    }

    pub fn is_protocol_anomaly(&self) -> bool {
        match self {
            ReplicationError::Transport(e) => e.is_protocol_anomaly(),
            ReplicationError::ReplicationLoop { .. }
            | ReplicationError::SelfConnection
            | ReplicationError::UnexpectedMessage { .. }
            | ReplicationError::HandshakeAlreadyDone => true,
            _ => false,
        }
    }
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;
