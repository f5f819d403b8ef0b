//! Receiver side of a replication channel
//!
//! Applies a peer's copy operations to the local registry under a source
//! named for the peer's handshake id. Copies are remembered per channel so
//! that a disconnect hands them to the eviction queue instead of removing
//! them outright.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use beacon_core::{InstanceInfo, Source};
use beacon_registry::{EvictionQueue, InstanceRegistry, RegistryReader};
use beacon_transport::MessageConnection;

use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::{ChannelState, ReplicationHello, ReplicationHelloReply, ReplicationMessage};

/// Inbound replication session from one peer
pub struct ReceiverReplicationChannel {
    own_id: String,
    registry: Arc<dyn InstanceRegistry>,
    evictions: EvictionQueue,
    conn: MessageConnection<ReplicationMessage>,
    state: ChannelState,
    peer_id: Option<String>,
    source: Option<Source>,
    /// Copies applied through this channel, by id
    copies: HashMap<String, InstanceInfo>,
}

impl ReceiverReplicationChannel {
    pub fn new(
        own_id: impl Into<String>,
        registry: Arc<dyn InstanceRegistry>,
        evictions: EvictionQueue,
        conn: MessageConnection<ReplicationMessage>,
    ) -> Self {
        ReceiverReplicationChannel {
            own_id: own_id.into(),
            registry,
            evictions,
            conn,
            state: ChannelState::Idle,
            peer_id: None,
            source: None,
            copies: HashMap::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Handshake id of the sending peer, once known
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Serve the channel until it ends.
    ///
    /// A protocol anomaly tears the connection down. Either way every copy
    /// still held for the peer is scheduled for eviction.
    pub async fn run(mut self) -> ReplicationResult<()> {
        let result = self.serve().await;
        if let Err(e) = &result {
            if e.is_protocol_anomaly() {
                warn!(peer = %self.conn.peer(), error = %e, "replication protocol violation, closing channel");
            } else {
                debug!(peer = %self.conn.peer(), error = %e, "replication channel ended");
            }
        }
        self.state = ChannelState::Closed;
        self.conn.close();
        self.release();
        result
    }

    async fn serve(&mut self) -> ReplicationResult<()> {
        while let Some(incoming) = self.conn.recv().await {
            self.handle(incoming.body)?;
            if let Some(correlation) = incoming.correlation {
                self.conn.acknowledge(correlation)?;
            }
        }
        self.conn.closed().await.map_err(ReplicationError::from)
    }

    fn handle(&mut self, message: ReplicationMessage) -> ReplicationResult<()> {
        trace!(peer = %self.conn.peer(), %message, "replication message");
        match message {
            ReplicationMessage::Hello(hello) => self.on_hello(hello),
            ReplicationMessage::HelloReply(_) => Err(self.unexpected(&message)),
            ReplicationMessage::RegisterCopy(info) => {
                let source = self.copy_source("RegisterCopy", info.id())?;
                self.registry.register(info.clone(), &source)?;
                self.copies.insert(info.id().to_string(), info);
                Ok(())
            }
            ReplicationMessage::UpdateCopy { info, deltas } => {
                let source = self.copy_source("UpdateCopy", info.id())?;
                if self.registry.update(info.clone(), &deltas, &source)?.is_none() {
                    // the peer believes we hold it; take the full copy
                    self.registry.register(info.clone(), &source)?;
                }
                self.copies.insert(info.id().to_string(), info);
                Ok(())
            }
            ReplicationMessage::UnregisterCopy { id } => {
                let source = self.copy_source("UnregisterCopy", &id)?;
                match self.copies.remove(&id) {
                    Some(info) => {
                        self.registry.unregister(&info, &source)?;
                    }
                    None => debug!(peer = %self.conn.peer(), id = %id, "unregister of unknown copy ignored"),
                }
                Ok(())
            }
        }
    }

    fn on_hello(&mut self, hello: ReplicationHello) -> ReplicationResult<()> {
        if self.state != ChannelState::Idle {
            return Err(ReplicationError::HandshakeAlreadyDone);
        }
        self.state = ChannelState::Handshaking;

        if hello.sender_id == self.own_id {
            warn!(peer = %self.conn.peer(), "replication hello carries this node's own id");
        }
        let reply = ReplicationHelloReply {
            source_id: self.own_id.clone(),
            seed_request: self.registry.size() == 0,
        };
        self.conn.submit(ReplicationMessage::HelloReply(reply))?;

        info!(
            peer = %self.conn.peer(),
            peer_id = %hello.sender_id,
            registry_size = hello.registry_size,
            "replication channel accepted"
        );
        self.source = Some(Source::replicated(hello.sender_id.as_str()));
        self.peer_id = Some(hello.sender_id);
        self.state = ChannelState::Active;
        Ok(())
    }

    /// Source for a copy operation, rejecting loops and pre-handshake traffic
    fn copy_source(&self, operation: &str, id: &str) -> ReplicationResult<Source> {
        let (Some(peer_id), Some(source)) = (&self.peer_id, &self.source) else {
            return Err(ReplicationError::UnexpectedMessage {
                state: self.state.as_str(),
                message: format!("{operation}({id})"),
            });
        };
        if *peer_id == self.own_id {
            return Err(ReplicationError::ReplicationLoop {
                own_id: self.own_id.clone(),
            });
        }
        Ok(source.clone())
    }

    fn unexpected(&self, message: &ReplicationMessage) -> ReplicationError {
        ReplicationError::UnexpectedMessage {
            state: self.state.as_str(),
            message: message.to_string(),
        }
    }

    /// Hand every remaining copy to the eviction queue
    fn release(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        let count = self.copies.len();
        for (_, info) in self.copies.drain() {
            self.evictions.add(info, source.clone());
        }
        if count > 0 {
            info!(peer = %self.conn.peer(), source = %source, count, "scheduled eviction of replicated copies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use beacon_core::{InstanceStatus, Origin};
    use beacon_registry::{EvictionConfig, EvictionStrategy, PreservableRegistry, SourcedRegistry};
    use beacon_transport::TransportError;

    fn info(id: &str) -> InstanceInfo {
        InstanceInfo::builder(id)
            .app("web")
            .status(InstanceStatus::Up)
            .last_dirty_timestamp(1)
            .build()
            .unwrap()
    }

    fn preservable() -> Arc<PreservableRegistry> {
        let config = EvictionConfig {
            timeout: Duration::from_secs(30),
            strategy: EvictionStrategy::Unlimited,
        };
        Arc::new(PreservableRegistry::new(Arc::new(SourcedRegistry::new()), &config))
    }

    fn pair() -> (
        MessageConnection<ReplicationMessage>,
        MessageConnection<ReplicationMessage>,
    ) {
        MessageConnection::pair(
            ("sender", "127.0.0.1:7300".parse().unwrap()),
            ("receiver", "127.0.0.1:7400".parse().unwrap()),
        )
    }

    fn start(
        own_id: &str,
        registry: &Arc<PreservableRegistry>,
        conn: MessageConnection<ReplicationMessage>,
    ) -> tokio::task::JoinHandle<ReplicationResult<()>> {
        let channel = ReceiverReplicationChannel::new(
            own_id,
            registry.clone(),
            registry.eviction_queue().clone(),
            conn,
        );
        tokio::spawn(channel.run())
    }

    async fn hello(sender: &MessageConnection<ReplicationMessage>, sender_id: &str) -> ReplicationHelloReply {
        sender
            .submit_with_ack(
                ReplicationMessage::Hello(ReplicationHello {
                    sender_id: sender_id.into(),
                    registry_size: 1,
                }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        match sender.recv().await.unwrap().body {
            ReplicationMessage::HelloReply(reply) => reply,
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_applies_copies_under_peer_source() {
        let registry = preservable();
        let (sender, conn) = pair();
        let _session = start("node-b", &registry, conn);

        let reply = hello(&sender, "node-a").await;
        assert_eq!(reply.source_id, "node-b");
        assert!(reply.seed_request);

        sender
            .submit_with_ack(ReplicationMessage::RegisterCopy(info("i-1")), Duration::from_secs(1))
            .await
            .unwrap();
        let (copy, source) = registry.get_sourced("i-1").unwrap();
        assert_eq!(copy, info("i-1"));
        assert_eq!(source.origin(), Origin::Replicated);
        assert_eq!(source.name(), "node-a");

        let down = info("i-1").with_status(InstanceStatus::Down, 2);
        sender
            .submit_with_ack(
                ReplicationMessage::UpdateCopy {
                    info: down.clone(),
                    deltas: down.diff_older(&info("i-1")),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(registry.get("i-1").unwrap().status(), InstanceStatus::Down);

        sender
            .submit_with_ack(
                ReplicationMessage::UnregisterCopy { id: "i-1".into() },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(registry.get("i-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_rejected_without_mutation() {
        let registry = preservable();
        let (sender, conn) = pair();
        let session = start("node-b", &registry, conn);

        let reply = hello(&sender, "node-b").await;
        assert_eq!(reply.source_id, "node-b");

        let ack = sender
            .submit_with_ack(ReplicationMessage::RegisterCopy(info("i-1")), Duration::from_secs(1))
            .await;
        assert_eq!(ack, Err(TransportError::Disconnected));
        assert_eq!(
            session.await.unwrap(),
            Err(ReplicationError::ReplicationLoop {
                own_id: "node-b".into()
            })
        );
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_before_hello_is_rejected() {
        let registry = preservable();
        let (sender, conn) = pair();
        let session = start("node-b", &registry, conn);

        sender
            .submit(ReplicationMessage::RegisterCopy(info("i-1")))
            .unwrap();
        let result = session.await.unwrap();
        assert!(matches!(result, Err(ReplicationError::UnexpectedMessage { .. })));
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_schedules_eviction() {
        let registry = preservable();
        let (sender, conn) = pair();
        let session = start("node-b", &registry, conn);

        hello(&sender, "node-a").await;
        sender
            .submit_with_ack(ReplicationMessage::RegisterCopy(info("i-1")), Duration::from_secs(1))
            .await
            .unwrap();

        sender.close();
        assert_eq!(
            session.await.unwrap(),
            Err(ReplicationError::Transport(TransportError::Disconnected))
        );
        // still present during the grace period
        assert!(registry.get("i-1").is_some());
        assert_eq!(registry.eviction_queue().pending(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.get("i-1").is_none());
    }
}
