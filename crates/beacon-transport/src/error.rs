//! Transport errors

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    // Connection lifecycle
    #[error("Connection closed")]
    Closed,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    // Acknowledgements
    #[error("No acknowledgement for message {correlation} within {timeout:?}")]
    AckTimeout { correlation: u64, timeout: Duration },

    #[error("Unexpected acknowledgement {0}")]
    UnexpectedAck(u64),
}

impl TransportError {
    /// Failures the owner recovers from by reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Closed
                | TransportError::Disconnected
                | TransportError::ConnectionRefused(_)
                | TransportError::AckTimeout { .. }
        )
    }

    pub fn is_protocol_anomaly(&self) -> bool {
        matches!(self, TransportError::UnexpectedAck(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
