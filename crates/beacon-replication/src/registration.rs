//! Client registration channel
//!
//! Each client connection registers one instance under its own local
//! source generation. An explicit `Unregister` removes the copy at once; a
//! connection that simply goes away leaves the copy to the eviction queue,
//! so a client that reconnects within the grace period is never seen as
//! gone. A client that stays connected but falls silent for longer than
//! the heartbeat timeout is treated as vanished too.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use beacon_core::{InstanceInfo, Source};
use beacon_registry::{EvictionQueue, InstanceRegistry};
use beacon_transport::{Connector, Incoming, MessageConnection};

use crate::error::{ReplicationError, ReplicationResult};
use crate::protocol::RegistrationMessage;

/// How often clients are expected to heartbeat
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Missed intervals after which a silent client counts as vanished
pub const HEARTBEAT_MISSES: u32 = 3;

/// Server side of one client connection
pub struct RegistrationChannel {
    registry: Arc<dyn InstanceRegistry>,
    evictions: EvictionQueue,
    conn: MessageConnection<RegistrationMessage>,
    source: Source,
    registered: Option<InstanceInfo>,
    heartbeats: u64,
    heartbeat_timeout: Option<Duration>,
}

impl RegistrationChannel {
    /// `node_id` names the local source; every channel gets a fresh generation
    pub fn new(
        node_id: &str,
        registry: Arc<dyn InstanceRegistry>,
        evictions: EvictionQueue,
        conn: MessageConnection<RegistrationMessage>,
    ) -> Self {
        RegistrationChannel {
            registry,
            evictions,
            conn,
            source: Source::local(node_id),
            registered: None,
            heartbeats: 0,
            heartbeat_timeout: None,
        }
    }

    /// End the channel when no message arrives within `timeout`
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub async fn run(mut self) -> ReplicationResult<()> {
        let result = self.serve().await;
        match &result {
            Err(e) if e.is_protocol_anomaly() => {
                warn!(client = %self.conn.peer(), error = %e, "registration protocol violation")
            }
            _ => debug!(client = %self.conn.peer(), ?result, "registration channel ended"),
        }
        self.conn.close();

        if let Some(info) = self.registered.take() {
            info!(id = info.id(), source = %self.source, "client vanished, scheduling eviction");
            self.evictions.add(info, self.source.clone());
        }
        result
    }

    async fn serve(&mut self) -> ReplicationResult<()> {
        while let Some(incoming) = self.next_message().await? {
            self.handle(incoming.body)?;
            if let Some(correlation) = incoming.correlation {
                self.conn.acknowledge(correlation)?;
            }
        }
        self.conn.closed().await.map_err(ReplicationError::from)
    }

    /// Any message counts as a sign of life
    async fn next_message(&self) -> ReplicationResult<Option<Incoming<RegistrationMessage>>> {
        let Some(limit) = self.heartbeat_timeout else {
            return Ok(self.conn.recv().await);
        };
        match tokio::time::timeout(limit, self.conn.recv()).await {
            Ok(incoming) => Ok(incoming),
            Err(_) => {
                warn!(client = %self.conn.peer(), ?limit, "client went silent");
                Err(ReplicationError::HeartbeatTimeout(limit))
            }
        }
    }

    fn handle(&mut self, message: RegistrationMessage) -> ReplicationResult<()> {
        match message {
            RegistrationMessage::Register(info) => {
                if let Some(current) = &self.registered {
                    if current.id() != info.id() {
                        return Err(ReplicationError::UnexpectedMessage {
                            state: "registered",
                            message: format!("Register({}) over {}", info.id(), current.id()),
                        });
                    }
                }
                let status = self.registry.register(info.clone(), &self.source)?;
                debug!(id = info.id(), source = %self.source, ?status, "client registration");
                self.registered = Some(info);
            }
            RegistrationMessage::Unregister => match self.registered.take() {
                Some(info) => {
                    let status = self.registry.unregister(&info, &self.source)?;
                    info!(id = info.id(), source = %self.source, ?status, "client unregistered");
                }
                None => debug!(client = %self.conn.peer(), "unregister without registration ignored"),
            },
            RegistrationMessage::Heartbeat => {
                self.heartbeats += 1;
                trace!(client = %self.conn.peer(), heartbeats = self.heartbeats, "heartbeat");
            }
        }
        Ok(())
    }
}

/// Client end of a registration connection
pub struct RegistrationClient {
    conn: MessageConnection<RegistrationMessage>,
    ack_timeout: Duration,
}

impl RegistrationClient {
    pub async fn connect<C: Connector<RegistrationMessage>>(
        connector: &C,
        addr: SocketAddr,
        ack_timeout: Duration,
    ) -> ReplicationResult<Self> {
        let conn = connector.connect(addr).await?;
        Ok(RegistrationClient { conn, ack_timeout })
    }

    pub fn from_connection(conn: MessageConnection<RegistrationMessage>, ack_timeout: Duration) -> Self {
        RegistrationClient { conn, ack_timeout }
    }

    async fn send(&self, message: RegistrationMessage) -> ReplicationResult<()> {
        self.conn.submit_with_ack(message, self.ack_timeout).await?;
        Ok(())
    }

    /// Register, or re-register with changed data
    pub async fn register(&self, info: InstanceInfo) -> ReplicationResult<()> {
        self.send(RegistrationMessage::Register(info)).await
    }

    pub async fn unregister(&self) -> ReplicationResult<()> {
        self.send(RegistrationMessage::Unregister).await
    }

    pub async fn heartbeat(&self) -> ReplicationResult<()> {
        self.send(RegistrationMessage::Heartbeat).await
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Drop the connection without unregistering
    pub fn disconnect(&self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::InstanceStatus;
    use beacon_registry::{
        EvictionConfig, EvictionStrategy, PreservableRegistry, RegistryReader, SourcedRegistry,
    };
    use beacon_transport::MemoryNetwork;

    fn info(id: &str, status: InstanceStatus) -> InstanceInfo {
        InstanceInfo::builder(id)
            .app("web")
            .status(status)
            .build()
            .unwrap()
    }

    struct Server {
        registry: Arc<PreservableRegistry>,
        network: MemoryNetwork<RegistrationMessage>,
        addr: SocketAddr,
    }

    fn server() -> Server {
        serve_at("127.0.0.1:7500", None)
    }

    fn serve_at(addr: &str, heartbeat_timeout: Option<Duration>) -> Server {
        let config = EvictionConfig {
            timeout: Duration::from_secs(10),
            strategy: EvictionStrategy::Unlimited,
        };
        let registry = Arc::new(PreservableRegistry::new(Arc::new(SourcedRegistry::new()), &config));
        let network = MemoryNetwork::new();
        let addr: SocketAddr = addr.parse().unwrap();
        let mut listener = network.bind(addr).unwrap();

        let accept_registry = registry.clone();
        tokio::spawn(async move {
            while let Some(conn) = listener.accept().await {
                let mut channel = RegistrationChannel::new(
                    "node-a",
                    accept_registry.clone(),
                    accept_registry.eviction_queue().clone(),
                    conn,
                );
                if let Some(timeout) = heartbeat_timeout {
                    channel = channel.with_heartbeat_timeout(timeout);
                }
                tokio::spawn(channel.run());
            }
        });
        Server {
            registry,
            network,
            addr,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_unregister() {
        let server = server();
        let client = RegistrationClient::connect(&server.network, server.addr, Duration::from_secs(1))
            .await
            .unwrap();

        client.register(info("i-1", InstanceStatus::Starting)).await.unwrap();
        client.register(info("i-1", InstanceStatus::Up)).await.unwrap();
        client.heartbeat().await.unwrap();
        assert_eq!(server.registry.get("i-1").unwrap().status(), InstanceStatus::Up);

        client.unregister().await.unwrap();
        assert!(server.registry.get("i-1").is_none());
        assert_eq!(server.registry.eviction_queue().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_client_is_evicted_after_grace() {
        let server = server();
        let client = RegistrationClient::connect(&server.network, server.addr, Duration::from_secs(1))
            .await
            .unwrap();
        client.register(info("i-1", InstanceStatus::Up)).await.unwrap();

        client.disconnect();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(server.registry.get("i-1").is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(server.registry.get("i-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_survives() {
        let server = server();
        let first = RegistrationClient::connect(&server.network, server.addr, Duration::from_secs(1))
            .await
            .unwrap();
        first.register(info("i-1", InstanceStatus::Up)).await.unwrap();
        first.disconnect();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = RegistrationClient::connect(&server.network, server.addr, Duration::from_secs(1))
            .await
            .unwrap();
        second.register(info("i-1", InstanceStatus::Up)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(server.registry.get("i-1").is_some());
        assert_eq!(server.registry.eviction_queue().evicted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_is_evicted() {
        let server = serve_at("127.0.0.1:7510", Some(Duration::from_secs(3)));
        let client = RegistrationClient::connect(&server.network, server.addr, Duration::from_secs(1))
            .await
            .unwrap();
        client.register(info("i-1", InstanceStatus::Up)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            client.heartbeat().await.unwrap();
        }
        assert!(server.registry.get("i-1").is_some());
        assert_eq!(server.registry.eviction_queue().pending(), 0);

        // connected but silent past the timeout
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(server.registry.eviction_queue().pending(), 1);
        assert!(server.registry.get("i-1").is_some());
        assert!(client.heartbeat().await.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(server.registry.get("i-1").is_none());
    }
}
