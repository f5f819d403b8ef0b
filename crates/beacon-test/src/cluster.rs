//! In-process registry cluster
//!
//! Every node binds a replication and a registration address on one shared
//! pair of in-memory networks. Node `i` listens on `127.0.0.1:7000+2i`
//! for replication and the next port for client registrations.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use beacon_replication::{RegistrationClient, ReplicationResult};
use beacon_runtime::{NodeConfig, NodeNetworks, NodeResult, RegistryNode};

pub const BASE_PORT: u16 = 7000;

/// Poll interval of [`wait_until`]
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn replication_addr(index: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], BASE_PORT + 2 * index as u16))
}

pub fn registration_addr(index: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], BASE_PORT + 2 * index as u16 + 1))
}

/// Poll `condition` until it holds or `limit` elapses. Returns whether it held.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Run `future` to completion or give up after `limit`
pub async fn within<F: Future>(limit: Duration, future: F) -> Option<F::Output> {
    tokio::time::timeout(limit, future).await.ok()
}

/// A set of registry nodes sharing one network
pub struct ClusterHarness {
    networks: NodeNetworks,
    nodes: Vec<RegistryNode>,
}

impl ClusterHarness {
    /// Start `size` nodes, each replicating to all the others
    pub fn start(size: usize, template: &NodeConfig) -> NodeResult<Self> {
        Self::launch(size, template, true)
    }

    /// Start `size` nodes with no peers configured
    pub fn start_isolated(size: usize, template: &NodeConfig) -> NodeResult<Self> {
        Self::launch(size, template, false)
    }

    fn launch(size: usize, template: &NodeConfig, mesh: bool) -> NodeResult<Self> {
        let networks = NodeNetworks::default();
        let mut nodes = Vec::with_capacity(size);
        for index in 0..size {
            let mut config = template.clone();
            config.node_id = format!("node-{index}");
            config.replication_addr = replication_addr(index);
            config.registration_addr = registration_addr(index);
            config.peers = if mesh {
                (0..size)
                    .filter(|other| *other != index)
                    .map(replication_addr)
                    .collect()
            } else {
                Vec::new()
            };
            nodes.push(RegistryNode::start(config, networks.clone())?);
        }
        info!(size, mesh, "cluster started");
        Ok(ClusterHarness { networks, nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &RegistryNode {
        &self.nodes[index]
    }

    pub fn networks(&self) -> &NodeNetworks {
        &self.networks
    }

    /// Open a registration channel to node `index`
    pub async fn connect_client(
        &self,
        index: usize,
        ack_timeout: Duration,
    ) -> ReplicationResult<RegistrationClient> {
        RegistrationClient::connect(&self.networks.registration, registration_addr(index), ack_timeout)
            .await
    }

    /// Sever replication into node `index` and refuse new channels to it.
    /// Returns the number of connection ends closed.
    pub fn partition(&self, index: usize) -> usize {
        let addr = replication_addr(index);
        self.networks.replication.block(addr);
        self.networks.replication.partition(addr)
    }

    /// Sever replication into node `index` once; peers may reconnect
    pub fn sever(&self, index: usize) -> usize {
        self.networks.replication.partition(replication_addr(index))
    }

    pub fn heal(&self, index: usize) {
        self.networks.replication.heal(replication_addr(index));
    }

    /// Whether every node holds exactly `size` entries
    pub fn converged_at(&self, size: usize) -> bool {
        self.nodes.iter().all(|node| node.size() == size)
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
