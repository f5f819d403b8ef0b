//! Sender side of a replication channel
//!
//! Opens the session with `Hello`, then streams every change of locally
//! asserted entries to the peer. Each copy operation is sent with an
//! acknowledgement; the first failed send or missed ack ends the session
//! and closes the connection, leaving reconnection to the owner.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use beacon_core::{ChangeNotification, Interest, Origin, SourceMatcher};
use beacon_registry::RegistryReader;
use beacon_transport::{Incoming, MessageConnection, TransportResult};

use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{
    ChannelState, ReplicationHello, ReplicationHelloReply, ReplicationMessage,
};
use crate::service::ReplicationConfig;

/// Result of a completed handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Active { peer_id: String, seed_request: bool },
    /// The peer answered with our own id; the channel is closed
    SelfConnection,
}

/// Outbound replication session to one peer
pub struct SenderReplicationChannel<R: ?Sized> {
    own_id: String,
    registry: Arc<R>,
    conn: MessageConnection<ReplicationMessage>,
    ack_timeout: Duration,
    handshake_timeout: Duration,
    state: ChannelState,
    /// Ids this session has registered on the peer
    asserted: HashSet<String>,
}

impl<R: RegistryReader + ?Sized> SenderReplicationChannel<R> {
    pub fn new(
        own_id: impl Into<String>,
        registry: Arc<R>,
        conn: MessageConnection<ReplicationMessage>,
        config: &ReplicationConfig,
    ) -> Self {
        SenderReplicationChannel {
            own_id: own_id.into(),
            registry,
            conn,
            ack_timeout: config.ack_timeout,
            handshake_timeout: config.handshake_timeout,
            state: ChannelState::Idle,
            asserted: HashSet::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Number of entries currently asserted on the peer
    pub fn asserted(&self) -> usize {
        self.asserted.len()
    }

    /// Handshake, then replicate until the connection or the registry ends.
    ///
    /// `Ok(Active)` means the session ended without a fault (closed locally
    /// or the registry shut down).
    pub async fn run(mut self) -> ReplicationResult<HandshakeOutcome> {
        let outcome = self.handshake().await?;
        if outcome == HandshakeOutcome::SelfConnection {
            return Ok(outcome);
        }

        let result = self.replicate().await;
        self.state = ChannelState::Closed;
        self.conn.close();
        result.map(|()| outcome)
    }

    /// Exchange `Hello` / `HelloReply`
    pub async fn handshake(&mut self) -> ReplicationResult<HandshakeOutcome> {
        if self.state != ChannelState::Idle {
            return Err(ReplicationError::HandshakeAlreadyDone);
        }
        self.state = ChannelState::Handshaking;

        let hello = ReplicationMessage::Hello(ReplicationHello {
            sender_id: self.own_id.clone(),
            registry_size: self.registry.size(),
        });
        debug!(peer = %self.conn.peer(), own_id = %self.own_id, "sending replication hello");

        let reply = match tokio::time::timeout(self.handshake_timeout, self.exchange_hello(hello))
            .await
        {
            Ok(reply) => reply,
            Err(_) => Err(ReplicationError::HandshakeTimeout(self.handshake_timeout)),
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.state = ChannelState::Closed;
                self.conn.close();
                return Err(e);
            }
        };

        if reply.source_id == self.own_id {
            info!(peer = %self.conn.peer(), "replication peer is this node, closing channel");
            self.state = ChannelState::Closed;
            self.conn.close();
            return Ok(HandshakeOutcome::SelfConnection);
        }

        info!(
            peer = %self.conn.peer(),
            peer_id = %reply.source_id,
            seed_request = reply.seed_request,
            "replication channel active"
        );
        self.state = ChannelState::Active;
        Ok(HandshakeOutcome::Active {
            peer_id: reply.source_id,
            seed_request: reply.seed_request,
        })
    }

    async fn exchange_hello(
        &self,
        hello: ReplicationMessage,
    ) -> ReplicationResult<ReplicationHelloReply> {
        self.conn.submit_with_ack(hello, self.ack_timeout).await?;
        match self.conn.recv().await {
            Some(Incoming {
                body: ReplicationMessage::HelloReply(reply),
                ..
            }) => Ok(reply),
            Some(other) => Err(ReplicationError::UnexpectedMessage {
                state: self.state.as_str(),
                message: other.body.to_string(),
            }),
            None => Err(ReplicationError::ChannelClosed),
        }
    }

    async fn replicate(&mut self) -> ReplicationResult<()> {
        let mut stream = self.registry.for_interest_sourced(
            &Interest::for_full_registry(),
            SourceMatcher::Origin(Origin::Local),
        );
        let mut inflight: JoinSet<TransportResult<()>> = JoinSet::new();
        let closed = self.conn.closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                outcome = &mut closed => {
                    debug!(peer = %self.conn.peer(), ?outcome, "replication connection ended");
                    return outcome.map_err(ReplicationError::from);
                }
                Some(joined) = inflight.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(peer = %self.conn.peer(), error = %e, "replication send failed, closing channel");
                            return Err(e.into());
                        }
                        Err(_) => return Err(ReplicationError::ChannelClosed),
                    }
                }
                next = stream.next() => match next {
                    Some(notification) => self.forward(notification, &mut inflight),
                    None => {
                        info!(peer = %self.conn.peer(), "registry stream ended, stopping replication");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn forward(
        &mut self,
        notification: ChangeNotification,
        inflight: &mut JoinSet<TransportResult<()>>,
    ) {
        let message = match notification {
            ChangeNotification::Add { data, .. } => {
                self.asserted.insert(data.id().to_string());
                ReplicationMessage::RegisterCopy(data)
            }
            ChangeNotification::Modify { data, deltas, .. } => {
                if self.asserted.insert(data.id().to_string()) {
                    ReplicationMessage::RegisterCopy(data)
                } else {
                    ReplicationMessage::UpdateCopy { info: data, deltas }
                }
            }
            ChangeNotification::Delete { data, .. } => {
                if !self.asserted.remove(data.id()) {
                    return;
                }
                ReplicationMessage::UnregisterCopy {
                    id: data.id().to_string(),
                }
            }
            ChangeNotification::BufferSentinel(_) => return,
        };

        trace!(peer = %self.conn.peer(), %message, "replicating");
        inflight.spawn(self.conn.submit_with_ack(message, self.ack_timeout));
    }
}
