//! In-memory network
//!
//! Listeners bind socket addresses inside one process; connecting hands the
//! listener the server end of a fresh connection pair. Addresses can be
//! blocked (connects are refused) and partitioned (live connections are
//! severed) to exercise failure handling.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{MessageConnection, TransportError, TransportResult, WeakConnection};

/// Opens connections to listening addresses
pub trait Connector<M>: Send + Sync + 'static {
    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = TransportResult<MessageConnection<M>>> + Send;
}

struct NetworkInner<M> {
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<MessageConnection<M>>>>,
    blocked: Mutex<HashSet<SocketAddr>>,
    /// Live connections by the listening address they were opened against
    live: Mutex<HashMap<SocketAddr, Vec<WeakConnection<M>>>>,
    next_port: AtomicU16,
}

/// Process-local network of message connections
pub struct MemoryNetwork<M> {
    inner: Arc<NetworkInner<M>>,
}

impl<M> Clone for MemoryNetwork<M> {
    fn clone(&self) -> Self {
        MemoryNetwork {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Send + 'static> MemoryNetwork<M> {
    pub fn new() -> Self {
        MemoryNetwork {
            inner: Arc::new(NetworkInner {
                listeners: Mutex::new(HashMap::new()),
                blocked: Mutex::new(HashSet::new()),
                live: Mutex::new(HashMap::new()),
                next_port: AtomicU16::new(40000),
            }),
        }
    }

    /// Start accepting connections on `addr`
    pub fn bind(&self, addr: SocketAddr) -> TransportResult<Listener<M>> {
        let mut listeners = self.inner.listeners.lock();
        if listeners.get(&addr).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AddressInUse(addr));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr, tx);
        debug!(%addr, "listener bound");

        Ok(Listener {
            addr,
            rx,
            network: Arc::downgrade(&self.inner),
        })
    }

    /// Open a connection to the listener on `addr`
    pub fn open(&self, addr: SocketAddr) -> TransportResult<MessageConnection<M>> {
        if self.inner.blocked.lock().contains(&addr) {
            return Err(TransportError::ConnectionRefused(addr));
        }
        let listener = self
            .inner
            .listeners
            .lock()
            .get(&addr)
            .filter(|tx| !tx.is_closed())
            .cloned()
            .ok_or(TransportError::ConnectionRefused(addr))?;

        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let (client, server) = MessageConnection::pair(
            (format!("{local}->{addr}"), local),
            (format!("{addr}<-{local}"), addr),
        );

        listener
            .send(server.clone())
            .map_err(|_| TransportError::ConnectionRefused(addr))?;

        let mut live = self.inner.live.lock();
        let conns = live.entry(addr).or_default();
        conns.retain(|c| c.upgrade().is_some_and(|c| c.is_open()));
        conns.push(client.downgrade());
        conns.push(server.downgrade());
        Ok(client)
    }

    /// Sever every live connection opened against `addr`
    pub fn partition(&self, addr: SocketAddr) -> usize {
        let severed: Vec<MessageConnection<M>> = self
            .inner
            .live
            .lock()
            .remove(&addr)
            .unwrap_or_default()
            .iter()
            .filter_map(WeakConnection::upgrade)
            .filter(|c| c.is_open())
            .collect();
        let count = severed.len();
        for conn in severed {
            conn.close_with_error(TransportError::Disconnected);
        }
        info!(%addr, count, "partitioned address");
        count
    }

    /// Refuse new connections to `addr`
    pub fn block(&self, addr: SocketAddr) {
        self.inner.blocked.lock().insert(addr);
    }

    /// Accept connections to `addr` again
    pub fn heal(&self, addr: SocketAddr) {
        self.inner.blocked.lock().remove(&addr);
    }

    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.inner
            .listeners
            .lock()
            .get(&addr)
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl<M: Send + 'static> Default for MemoryNetwork<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> Connector<M> for MemoryNetwork<M> {
    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = TransportResult<MessageConnection<M>>> + Send {
        let result = self.open(addr);
        async move { result }
    }
}

/// Accepting end of a bound address
pub struct Listener<M> {
    addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<MessageConnection<M>>,
    network: Weak<NetworkInner<M>>,
}

impl<M> Listener<M> {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Next inbound connection; `None` once the network is gone
    pub async fn accept(&mut self) -> Option<MessageConnection<M>> {
        self.rx.recv().await
    }
}

impl<M> Drop for Listener<M> {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(network) = self.network.upgrade() {
            let mut listeners = network.listeners.lock();
            // a newer listener may have taken the address over
            if listeners.get(&self.addr).is_some_and(|tx| tx.is_closed()) {
                listeners.remove(&self.addr);
            }
        }
    }
}
