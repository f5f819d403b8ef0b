//! Registry node - wiring and query surface
//!
//! Instances registered through the query surface hold a lease under their
//! own local source generation. A lease not renewed within three heartbeat
//! intervals expires and its copy goes to the eviction queue, the same path
//! a vanished registration channel takes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use beacon_core::{BeaconError, InstanceInfo, InstanceStatus, Interest, Source};
use beacon_registry::{
    HolderSummary, InstanceRegistry, NotificationStream, PreservableRegistry, RegistrationStatus,
    RegistryReader, SourcedRegistry, StatusOverrides,
};
use beacon_replication::{
    BatchReplicationHandler, PeerChange, ReceiverReplicationChannel, RegistrationChannel,
    RegistrationMessage, ReplicationError, ReplicationList, ReplicationListResponse,
    ReplicationMessage, ReplicationService,
};
use beacon_time::DirtyClock;
use beacon_transport::{Listener, MemoryNetwork, TransportError};

use crate::config::{ConfigError, NodeConfig};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] BeaconError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// The networks a node listens and connects on
#[derive(Clone, Default)]
pub struct NodeNetworks {
    pub replication: MemoryNetwork<ReplicationMessage>,
    pub registration: MemoryNetwork<RegistrationMessage>,
}

type LayeredRegistry = StatusOverrides<PreservableRegistry>;

/// A registration made through the node, kept alive by renewals
#[derive(Clone, Debug)]
struct Lease {
    source: Source,
    renewed: Instant,
}

/// A running registry node
pub struct RegistryNode {
    config: NodeConfig,
    clock: Arc<DirtyClock>,
    preservable: Arc<PreservableRegistry>,
    registry: Arc<LayeredRegistry>,
    replication: ReplicationService<MemoryNetwork<ReplicationMessage>>,
    peer_feed: mpsc::UnboundedSender<PeerChange>,
    batch: BatchReplicationHandler<LayeredRegistry>,
    leases: Arc<DashMap<String, Lease>>,
    accept_loops: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryNode {
    /// Build the node and start its accept loops and replication service.
    /// Must be called inside a tokio runtime.
    pub fn start(config: NodeConfig, networks: NodeNetworks) -> NodeResult<Self> {
        let replication_listener = networks.replication.bind(config.replication_addr)?;
        let registration_listener = networks.registration.bind(config.registration_addr)?;

        let clock = Arc::new(DirtyClock::new());
        let base = Arc::new(SourcedRegistry::new());
        let preservable = Arc::new(PreservableRegistry::new(base, &config.eviction()));
        let registry = Arc::new(StatusOverrides::new(
            Arc::clone(&preservable),
            Arc::clone(&clock),
        ));

        let (peer_feed, peers) = mpsc::unbounded_channel();
        let replication = ReplicationService::start(
            config.node_id.as_str(),
            registry.clone(),
            networks.replication.clone(),
            config.replication(),
            peers,
        );
        for peer in &config.peers {
            replication.add_peer(*peer);
        }

        let leases = Arc::new(DashMap::new());
        let accept_loops = vec![
            tokio::spawn(accept_replication(
                replication_listener,
                config.node_id.clone(),
                Arc::clone(&registry),
                Arc::clone(&preservable),
            )),
            tokio::spawn(accept_registrations(
                registration_listener,
                config.node_id.clone(),
                Arc::clone(&registry),
                Arc::clone(&preservable),
                config.lease_duration(),
            )),
            tokio::spawn(expire_leases(
                Arc::clone(&leases),
                Arc::clone(&preservable),
                config.heartbeat_interval,
                config.lease_duration(),
            )),
        ];

        info!(
            node_id = %config.node_id,
            replication = %config.replication_addr,
            registration = %config.registration_addr,
            peers = config.peers.len(),
            "registry node started"
        );

        Ok(RegistryNode {
            batch: BatchReplicationHandler::new(Arc::clone(&registry)),
            config,
            clock,
            preservable,
            registry,
            replication,
            peer_feed,
            leases,
            accept_loops: Mutex::new(accept_loops),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The layered registry (status overrides over the preservable store)
    pub fn registry(&self) -> &Arc<StatusOverrides<PreservableRegistry>> {
        &self.registry
    }

    /// Sender feeding peer address changes to the replication service
    pub fn peer_feed(&self) -> mpsc::UnboundedSender<PeerChange> {
        self.peer_feed.clone()
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    /// Register or re-register `info` as a local instance of this node.
    /// A live lease keeps its source; otherwise a fresh generation is used.
    pub fn register(&self, info: InstanceInfo) -> NodeResult<RegistrationStatus> {
        let info = self.stamp(info)?;
        match self.leases.entry(info.id().to_string()) {
            Entry::Occupied(mut held) => {
                let status = self.registry.register(info, &held.get().source)?;
                held.get_mut().renewed = Instant::now();
                Ok(status)
            }
            Entry::Vacant(slot) => {
                let source = Source::local(self.config.node_id.as_str());
                let status = self.registry.register(info, &source)?;
                slot.insert(Lease {
                    source,
                    renewed: Instant::now(),
                });
                Ok(status)
            }
        }
    }

    pub fn unregister(&self, id: &str) -> NodeResult<RegistrationStatus> {
        let Some((_, lease)) = self.leases.remove(id) else {
            debug!(id, "unregister without a lease ignored");
            return Ok(RegistrationStatus::RemovedNoChange);
        };
        let Some(info) = self.registry.copy_of(id, &lease.source) else {
            return Ok(RegistrationStatus::RemovedNoChange);
        };
        Ok(self.registry.unregister(&info, &lease.source)?)
    }

    /// Record a heartbeat for `id`; fails once the lease has expired
    pub fn renew(&self, id: &str) -> NodeResult<()> {
        match self.leases.get_mut(id) {
            Some(mut lease) => {
                lease.renewed = Instant::now();
                Ok(())
            }
            None => Err(BeaconError::InstanceNotFound(id.to_string()).into()),
        }
    }

    /// Time of the last registration or heartbeat of `id`
    pub fn last_renewal(&self, id: &str) -> Option<Instant> {
        self.leases.get(id).map(|lease| lease.renewed)
    }

    pub fn status_update(&self, id: &str, status: InstanceStatus) -> NodeResult<RegistrationStatus> {
        Ok(self.registry.status_update(id, status)?)
    }

    pub fn delete_status_override(
        &self,
        id: &str,
        new_status: Option<InstanceStatus>,
    ) -> NodeResult<RegistrationStatus> {
        Ok(self.registry.delete_status_override(id, new_status)?)
    }

    pub fn get_instance(&self, app: &str, id: &str) -> Option<InstanceInfo> {
        self.registry.get(id).filter(|info| info.app() == app)
    }

    pub fn get_instances_by_vip(&self, vip: &str) -> Vec<InstanceInfo> {
        let mut found = self.registry.for_snapshot(&Interest::for_vip(vip));
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    pub fn for_interest(&self, interest: &Interest) -> NotificationStream {
        self.registry.for_interest(interest)
    }

    pub fn size(&self) -> usize {
        self.registry.size()
    }

    pub fn holders(&self) -> Vec<HolderSummary> {
        self.preservable.holders()
    }

    pub fn is_in_self_preservation(&self) -> bool {
        self.preservable.is_in_self_preservation()
    }

    /// Pending evictions
    pub fn pending_evictions(&self) -> usize {
        self.preservable.eviction_queue().pending()
    }

    // ========================================================================
    // Replication
    // ========================================================================

    pub fn add_peer(&self, addr: SocketAddr) {
        self.replication.add_peer(addr);
    }

    pub fn remove_peer(&self, addr: SocketAddr) -> bool {
        self.replication.remove_peer(addr)
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.replication.peers()
    }

    /// Apply a batch from `peer`; responses are positional
    pub fn process_batch(&self, peer: &str, list: ReplicationList) -> ReplicationListResponse {
        self.batch.process(peer, list)
    }

    /// Stop replication and the accept loops, then the registry itself
    pub fn shutdown(&self) {
        self.replication.shutdown();
        for task in self.accept_loops.lock().drain(..) {
            task.abort();
        }
        self.preservable.shutdown();
        info!(node_id = %self.config.node_id, "registry node stopped");
    }

    /// Give `info` a dirty timestamp if it has none, and keep the clock
    /// ahead of the ones it carries
    fn stamp(&self, info: InstanceInfo) -> NodeResult<InstanceInfo> {
        if info.last_dirty_timestamp() == 0 {
            let stamped = info
                .to_builder()
                .last_dirty_timestamp(self.clock.tick())
                .build()?;
            return Ok(stamped);
        }
        self.clock.observe(info.last_dirty_timestamp());
        Ok(info)
    }
}

impl Drop for RegistryNode {
    fn drop(&mut self) {
        for task in self.accept_loops.lock().drain(..) {
            task.abort();
        }
    }
}

async fn accept_replication(
    mut listener: Listener<ReplicationMessage>,
    node_id: String,
    registry: Arc<LayeredRegistry>,
    preservable: Arc<PreservableRegistry>,
) {
    while let Some(conn) = listener.accept().await {
        debug!(peer = %conn.peer(), "replication channel opened");
        let channel = ReceiverReplicationChannel::new(
            node_id.as_str(),
            registry.clone(),
            preservable.eviction_queue().clone(),
            conn,
        );
        tokio::spawn(channel.run());
    }
}

async fn accept_registrations(
    mut listener: Listener<RegistrationMessage>,
    node_id: String,
    registry: Arc<LayeredRegistry>,
    preservable: Arc<PreservableRegistry>,
    heartbeat_timeout: Duration,
) {
    while let Some(conn) = listener.accept().await {
        debug!(client = %conn.peer(), "registration channel opened");
        let channel = RegistrationChannel::new(
            &node_id,
            registry.clone(),
            preservable.eviction_queue().clone(),
            conn,
        )
        .with_heartbeat_timeout(heartbeat_timeout);
        tokio::spawn(channel.run());
    }
}

/// Hand copies whose lease ran out to the eviction queue
async fn expire_leases(
    leases: Arc<DashMap<String, Lease>>,
    preservable: Arc<PreservableRegistry>,
    interval: Duration,
    lease_duration: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let stale: Vec<(String, Instant)> = leases
            .iter()
            .filter(|entry| now.duration_since(entry.renewed) > lease_duration)
            .map(|entry| (entry.key().clone(), entry.renewed))
            .collect();
        trace!(leases = leases.len(), stale = stale.len(), "lease sweep");

        for (id, renewed) in stale {
            // a renewal since the scan wins
            let Some((_, lease)) = leases.remove_if(&id, |_, lease| lease.renewed == renewed) else {
                continue;
            };
            match preservable.copy_of(&id, &lease.source) {
                Some(info) => {
                    info!(id = %id, source = %lease.source, "lease expired, scheduling eviction");
                    preservable.schedule_eviction(info, lease.source);
                }
                None => debug!(id = %id, "lease expired without a copy"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(node_id: &str, base: u16) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            replication_addr: SocketAddr::from(([127, 0, 0, 1], base)),
            registration_addr: SocketAddr::from(([127, 0, 0, 1], base + 1)),
            eviction_timeout: Duration::from_secs(5),
            ..NodeConfig::default()
        }
    }

    fn info(id: &str, vip: &str) -> InstanceInfo {
        InstanceInfo::builder(id)
            .app("web")
            .vip_address(vip)
            .status(InstanceStatus::Up)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_surface() {
        let node = RegistryNode::start(config("node-a", 9000), NodeNetworks::default()).unwrap();

        node.register(info("i-2", "web.vip")).unwrap();
        node.register(info("i-1", "web.vip")).unwrap();
        node.register(info("i-3", "api.vip")).unwrap();

        let stored = node.get_instance("web", "i-1").unwrap();
        assert!(stored.last_dirty_timestamp() > 0);
        assert!(node.get_instance("other", "i-1").is_none());

        let ids: Vec<String> = node
            .get_instances_by_vip("web.vip")
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);

        node.renew("i-1").unwrap();
        assert!(node.last_renewal("i-1").is_some());
        assert!(matches!(
            node.renew("ghost"),
            Err(NodeError::Registry(BeaconError::InstanceNotFound(_)))
        ));

        node.status_update("i-1", InstanceStatus::OutOfService).unwrap();
        assert_eq!(
            node.get_instance("web", "i-1").unwrap().status(),
            InstanceStatus::OutOfService
        );
        node.delete_status_override("i-1", Some(InstanceStatus::Up)).unwrap();
        assert_eq!(node.get_instance("web", "i-1").unwrap().status(), InstanceStatus::Up);

        assert_eq!(node.unregister("i-1").unwrap(), RegistrationStatus::RemovedLast);
        assert_eq!(node.size(), 2);
        node.shutdown();
    }

    fn leased_config(node_id: &str, base: u16) -> NodeConfig {
        NodeConfig {
            heartbeat_interval: Duration::from_secs(1),
            self_preservation_percent: None,
            ..config(node_id, base)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrenewed_lease_is_evicted() {
        let node = RegistryNode::start(leased_config("node-a", 9020), NodeNetworks::default()).unwrap();
        node.register(info("i-1", "web.vip")).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        node.renew("i-1").unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(node.pending_evictions(), 0);

        // three missed intervals since the renewal
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(node.pending_evictions(), 1);
        assert!(node.get_instance("web", "i-1").is_some());
        assert!(node.last_renewal("i-1").is_none());
        assert!(matches!(
            node.renew("i-1"),
            Err(NodeError::Registry(BeaconError::InstanceNotFound(_)))
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(node.get_instance("web", "i-1").is_none());
        assert_eq!(node.size(), 0);
        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_expiry_survives_eviction() {
        let node = RegistryNode::start(leased_config("node-a", 9030), NodeNetworks::default()).unwrap();
        node.register(info("i-1", "web.vip")).unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(node.pending_evictions(), 1);
        node.register(info("i-1", "web.vip")).unwrap();

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            node.renew("i-1").unwrap();
        }
        assert_eq!(node.pending_evictions(), 0);
        assert_eq!(node.preservable.eviction_queue().evicted(), 1);
        assert!(node.get_instance("web", "i-1").is_some());
        assert_eq!(node.holders()[0].copies, 1);
        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_conflict_fails_start() {
        let networks = NodeNetworks::default();
        let _first = RegistryNode::start(config("node-a", 9010), networks.clone()).unwrap();
        let second = RegistryNode::start(config("node-b", 9010), networks);
        assert!(matches!(
            second,
            Err(NodeError::Transport(TransportError::AddressInUse(_)))
        ));
    }
}
