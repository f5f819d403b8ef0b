//! Replication service - one outbound session per peer
//!
//! Consumes a feed of peer address changes. Every added address gets a
//! handler task that connects, runs a sender session and, when the session
//! ends for any reason other than a self-connection, reconnects after a
//! fixed delay for as long as the address stays in the feed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_registry::RegistryReader;
use beacon_transport::Connector;

use crate::error::ReplicationResult;
use crate::protocol::ReplicationMessage;
use crate::sender::{HandshakeOutcome, SenderReplicationChannel};

/// Default delay between a failed session and the next attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Default wait for a copy acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wait for the handshake reply
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Replication timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub reconnect_delay: Duration,
    /// Zero waits for acknowledgements indefinitely
    pub ack_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Change in the resolved set of peer addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerChange {
    Add(SocketAddr),
    Delete(SocketAddr),
}

struct PeerHandler {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeerHandler {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

struct ServiceInner<C> {
    own_id: String,
    registry: Arc<dyn RegistryReader>,
    connector: C,
    config: ReplicationConfig,
    handlers: Mutex<HashMap<SocketAddr, PeerHandler>>,
    stopped: AtomicBool,
}

impl<C: Connector<ReplicationMessage>> ServiceInner<C> {
    fn add_peer(self: &Arc<Self>, addr: SocketAddr) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let mut handlers = self.handlers.lock();
        if handlers.get(&addr).is_some_and(PeerHandler::is_running) {
            debug!(peer = %addr, "replication peer already handled");
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_peer(Arc::clone(self), addr, stop_rx));
        handlers.insert(addr, PeerHandler { stop, task });
        info!(peer = %addr, "replication peer added");
    }

    fn remove_peer(&self, addr: SocketAddr) -> bool {
        match self.handlers.lock().remove(&addr) {
            Some(handler) => {
                let _ = handler.stop.send(true);
                info!(peer = %addr, "replication peer removed");
                true
            }
            None => false,
        }
    }

    async fn session(&self, addr: SocketAddr) -> ReplicationResult<HandshakeOutcome> {
        let conn = self.connector.connect(addr).await?;
        SenderReplicationChannel::new(
            self.own_id.as_str(),
            Arc::clone(&self.registry),
            conn,
            &self.config,
        )
        .run()
        .await
    }
}

async fn run_peer<C: Connector<ReplicationMessage>>(
    inner: Arc<ServiceInner<C>>,
    addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
) {
    let mut attempt: u64 = 0;
    loop {
        if *stop.borrow() {
            break;
        }
        attempt += 1;
        let outcome = tokio::select! {
            _ = stop.changed() => break,
            outcome = inner.session(addr) => outcome,
        };

        match outcome {
            Ok(HandshakeOutcome::SelfConnection) => {
                warn!(peer = %addr, "peer address points at this node, not replicating to it");
                break;
            }
            Ok(HandshakeOutcome::Active { peer_id, .. }) => {
                debug!(peer = %addr, %peer_id, attempt, "replication session ended");
            }
            Err(e) if e.is_transient() => {
                debug!(peer = %addr, attempt, error = %e, "replication session failed");
            }
            Err(e) => {
                warn!(peer = %addr, attempt, error = %e, "replication session failed");
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
    }
    debug!(peer = %addr, "replication handler stopped");
}

/// Maintains outbound replication to every peer in the address feed
pub struct ReplicationService<C> {
    inner: Arc<ServiceInner<C>>,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector<ReplicationMessage>> ReplicationService<C> {
    /// Start consuming `peers` on the current runtime
    pub fn start(
        own_id: impl Into<String>,
        registry: Arc<dyn RegistryReader>,
        connector: C,
        config: ReplicationConfig,
        mut peers: mpsc::UnboundedReceiver<PeerChange>,
    ) -> Self {
        let inner = Arc::new(ServiceInner {
            own_id: own_id.into(),
            registry,
            connector,
            config,
            handlers: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });
        info!(own_id = %inner.own_id, "replication service started");

        let feed_inner = Arc::clone(&inner);
        let feed = tokio::spawn(async move {
            while let Some(change) = peers.recv().await {
                match change {
                    PeerChange::Add(addr) => feed_inner.add_peer(addr),
                    PeerChange::Delete(addr) => {
                        feed_inner.remove_peer(addr);
                    }
                }
            }
            debug!("peer feed ended");
        });

        ReplicationService {
            inner,
            feed: Mutex::new(Some(feed)),
        }
    }

    pub fn own_id(&self) -> &str {
        &self.inner.own_id
    }

    pub fn add_peer(&self, addr: SocketAddr) {
        self.inner.add_peer(addr);
    }

    /// Stop replicating to `addr`; false if it was not a peer
    pub fn remove_peer(&self, addr: SocketAddr) -> bool {
        self.inner.remove_peer(addr)
    }

    /// Addresses with a running handler, sorted
    pub fn peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self
            .inner
            .handlers
            .lock()
            .iter()
            .filter(|(_, h)| h.is_running())
            .map(|(addr, _)| *addr)
            .collect();
        peers.sort();
        peers
    }

    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(feed) = self.feed.lock().take() {
            feed.abort();
        }
        let handlers: Vec<(SocketAddr, PeerHandler)> = self.inner.handlers.lock().drain().collect();
        for (_, handler) in &handlers {
            let _ = handler.stop.send(true);
        }
        info!(peers = handlers.len(), "replication service shut down");
    }
}

impl<C> Drop for ReplicationService<C> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.lock().take() {
            feed.abort();
        }
        for (_, handler) in self.inner.handlers.lock().drain() {
            let _ = handler.stop.send(true);
        }
    }
}
