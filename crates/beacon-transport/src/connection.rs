//! Acknowledged message connection
//!
//! One side of an ordered, point-to-point message channel. Messages may be
//! sent fire-and-forget (`submit`) or with a correlation id
//! (`submit_with_ack`) whose completion resolves when the peer calls
//! `acknowledge` for it, or fails once its ack timeout passes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use beacon_time::DeadlineQueue;

use crate::{TransportError, TransportResult};

/// Unit of transmission between the two ends of a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<M> {
    Message { correlation: Option<u64>, body: M },
    Ack { correlation: u64 },
}

/// A received message; `correlation` is set when the sender expects an ack
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Incoming<M> {
    pub body: M,
    pub correlation: Option<u64>,
}

type AckSender = oneshot::Sender<TransportResult<()>>;
type Lifecycle = watch::Sender<Option<TransportResult<()>>>;

/// Outstanding acknowledgements of one connection
struct AckTable {
    pending: Mutex<HashMap<u64, AckSender>>,
    next_correlation: AtomicU64,
    expiry: DeadlineQueue<(u64, Duration)>,
    unexpected: AtomicU64,
}

impl AckTable {
    fn new() -> Self {
        AckTable {
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            expiry: DeadlineQueue::new(),
            unexpected: AtomicU64::new(0),
        }
    }

    fn resolve(&self, correlation: u64, label: &str) {
        match self.pending.lock().remove(&correlation) {
            Some(tx) => {
                let _ = tx.send(Ok(()));
            }
            None => {
                self.unexpected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = label,
                    correlation,
                    error = %TransportError::UnexpectedAck(correlation),
                    "ignoring acknowledgement"
                );
            }
        }
    }

    fn expire(&self, correlation: u64, timeout: Duration, label: &str) {
        if let Some(tx) = self.pending.lock().remove(&correlation) {
            debug!(connection = label, correlation, ?timeout, "acknowledgement timed out");
            let _ = tx.send(Err(TransportError::AckTimeout {
                correlation,
                timeout,
            }));
        }
    }

    /// Fail everything outstanding, without waiting for in-flight acks
    fn fail_all(&self, error: TransportError) {
        self.expiry.close();
        self.expiry.drain();
        let drained: Vec<AckSender> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

struct Shared<M> {
    label: String,
    peer: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame<M>>>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming<M>>>,
    acks: Arc<AckTable>,
    lifecycle: Arc<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<M> Shared<M> {
    fn terminate(&self, outcome: TransportResult<()>) {
        let error = match &outcome {
            Ok(()) => TransportError::Closed,
            Err(e) => e.clone(),
        };
        self.outbound.lock().take();
        self.acks.fail_all(error);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        finish(&self.lifecycle, outcome);
    }
}

impl<M> Drop for Shared<M> {
    fn drop(&mut self) {
        self.terminate(Ok(()));
    }
}

/// Complete the lifecycle signal; only the first outcome sticks
fn finish(lifecycle: &Lifecycle, outcome: TransportResult<()>) {
    lifecycle.send_if_modified(|state| {
        if state.is_none() {
            *state = Some(outcome);
            true
        } else {
            false
        }
    });
}

/// One end of an acknowledged message channel
pub struct MessageConnection<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for MessageConnection<M> {
    fn clone(&self) -> Self {
        MessageConnection {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Non-owning handle; does not keep the connection open
pub struct WeakConnection<M> {
    shared: Weak<Shared<M>>,
}

impl<M> WeakConnection<M> {
    pub fn upgrade(&self) -> Option<MessageConnection<M>> {
        self.shared.upgrade().map(|shared| MessageConnection { shared })
    }
}

impl<M> fmt::Debug for MessageConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConnection")
            .field("label", &self.shared.label)
            .field("peer", &self.shared.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl<M: Send + 'static> MessageConnection<M> {
    /// Two connected ends. Must be called inside a tokio runtime.
    pub fn pair(
        (label_a, addr_a): (impl Into<String>, SocketAddr),
        (label_b, addr_b): (impl Into<String>, SocketAddr),
    ) -> (MessageConnection<M>, MessageConnection<M>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        // a's peer is b and vice versa
        let a = Self::spawn(label_a.into(), addr_b, b_tx, a_rx);
        let b = Self::spawn(label_b.into(), addr_a, a_tx, b_rx);
        (a, b)
    }

    fn spawn(
        label: String,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Frame<M>>,
        inbound: mpsc::UnboundedReceiver<Frame<M>>,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(None);
        let acks = Arc::new(AckTable::new());
        let lifecycle = Arc::new(lifecycle);

        let reader = tokio::spawn(read_frames(
            label.clone(),
            inbound,
            incoming_tx,
            Arc::clone(&acks),
            Arc::clone(&lifecycle),
        ));
        let expiry = tokio::spawn(expire_acks(label.clone(), Arc::clone(&acks)));

        MessageConnection {
            shared: Arc::new(Shared {
                label,
                peer,
                outbound: Mutex::new(Some(outbound)),
                incoming: tokio::sync::Mutex::new(incoming_rx),
                acks,
                lifecycle,
                tasks: Mutex::new(vec![reader, expiry]),
            }),
        }
    }
}

impl<M> MessageConnection<M> {
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn downgrade(&self) -> WeakConnection<M> {
        WeakConnection {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Address of the other end
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.borrow().is_none()
    }

    fn send_frame(&self, frame: Frame<M>) -> TransportResult<()> {
        let outbound = self.shared.outbound.lock();
        let tx = outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    /// Fire-and-forget send
    pub fn submit(&self, body: M) -> TransportResult<()> {
        self.send_frame(Frame::Message {
            correlation: None,
            body,
        })
    }

    /// Send and wait for the peer's acknowledgement.
    ///
    /// A zero `timeout` waits indefinitely; the future still fails as soon
    /// as the connection ends.
    pub fn submit_with_ack(&self, body: M, timeout: Duration) -> AckFuture {
        let acks = &self.shared.acks;
        let correlation = acks.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        acks.pending.lock().insert(correlation, tx);

        let sent = self.send_frame(Frame::Message {
            correlation: Some(correlation),
            body,
        });
        if let Err(e) = sent {
            acks.pending.lock().remove(&correlation);
            return AckFuture::failed(e);
        }

        if !timeout.is_zero() {
            acks.expiry.push_after((correlation, timeout), timeout);
        }
        trace!(connection = %self.shared.label, correlation, "message sent, awaiting ack");
        AckFuture::waiting(rx)
    }

    /// Acknowledge a received message
    pub fn acknowledge(&self, correlation: u64) -> TransportResult<()> {
        self.send_frame(Frame::Ack { correlation })
    }

    /// Next received message; `None` once the connection ended
    pub async fn recv(&self) -> Option<Incoming<M>> {
        self.shared.incoming.lock().await.recv().await
    }

    /// Acks awaiting a reply
    pub fn pending_acks(&self) -> usize {
        self.shared.acks.pending.lock().len()
    }

    /// Acks received for nothing outstanding
    pub fn unexpected_acks(&self) -> u64 {
        self.shared.acks.unexpected.load(Ordering::Relaxed)
    }

    /// Close cleanly; pending acks fail immediately with `Closed`
    pub fn close(&self) {
        debug!(connection = %self.shared.label, "closing connection");
        self.shared.terminate(Ok(()));
    }

    /// Close with an error, which becomes the lifecycle outcome
    pub fn close_with_error(&self, error: TransportError) {
        debug!(connection = %self.shared.label, %error, "closing connection with error");
        self.shared.terminate(Err(error));
    }

    /// Completes when the connection ends: `Ok` for a local close, the
    /// error otherwise
    pub fn closed(&self) -> impl Future<Output = TransportResult<()>> + Send + 'static {
        let mut rx = self.shared.lifecycle.subscribe();
        async move {
            loop {
                let state = rx.borrow_and_update().clone();
                if let Some(outcome) = state {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        }
    }
}

async fn read_frames<M>(
    label: String,
    mut inbound: mpsc::UnboundedReceiver<Frame<M>>,
    incoming: mpsc::UnboundedSender<Incoming<M>>,
    acks: Arc<AckTable>,
    lifecycle: Arc<Lifecycle>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Ack { correlation } => acks.resolve(correlation, &label),
            Frame::Message { correlation, body } => {
                if incoming.send(Incoming { body, correlation }).is_err() {
                    break;
                }
            }
        }
    }
    trace!(connection = %label, "peer went away");
    acks.fail_all(TransportError::Disconnected);
    finish(&lifecycle, Err(TransportError::Disconnected));
}

async fn expire_acks(label: String, acks: Arc<AckTable>) {
    while let Some(expired) = acks.expiry.wait_expired().await {
        for (correlation, timeout) in expired {
            acks.expire(correlation, timeout, &label);
        }
    }
}

enum AckState {
    Waiting(oneshot::Receiver<TransportResult<()>>),
    Failed(Option<TransportError>),
}

/// Completion of one acknowledged send
pub struct AckFuture {
    state: AckState,
}

impl AckFuture {
    fn waiting(rx: oneshot::Receiver<TransportResult<()>>) -> Self {
        AckFuture {
            state: AckState::Waiting(rx),
        }
    }

    fn failed(error: TransportError) -> Self {
        AckFuture {
            state: AckState::Failed(Some(error)),
        }
    }
}

impl Future for AckFuture {
    type Output = TransportResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            AckState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
                Poll::Pending => Poll::Pending,
            },
            AckState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(TransportError::Closed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn pair() -> (MessageConnection<&'static str>, MessageConnection<&'static str>) {
        MessageConnection::pair(
            ("client", "127.0.0.1:1000".parse().unwrap()),
            ("server", "127.0.0.1:2000".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_submit_and_ack() {
        let (client, server) = pair();
        let ack = client.submit_with_ack("hello", Duration::from_secs(5));

        let incoming = server.recv().await.unwrap();
        assert_eq!(incoming.body, "hello");
        server.acknowledge(incoming.correlation.unwrap()).unwrap();

        assert!(ack.await.is_ok());
        assert_eq!(client.pending_acks(), 0);
        assert_eq!(client.peer(), "127.0.0.1:2000".parse().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let (client, server) = pair();
        let start = Instant::now();
        let result = client
            .submit_with_ack("ignored", Duration::from_millis(50))
            .await;

        let elapsed = start.elapsed();
        assert!(matches!(result, Err(TransportError::AckTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(60));
        assert_eq!(client.pending_acks(), 0);
        drop(server);
    }

    #[tokio::test]
    async fn test_unexpected_ack_is_not_fatal() {
        let (client, server) = pair();
        server.acknowledge(999).unwrap();
        server.submit("after").unwrap();

        // ordering: the ack is processed before the message arrives
        assert_eq!(client.recv().await.unwrap().body, "after");
        assert_eq!(client.unexpected_acks(), 1);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_counted_once() {
        let (client, server) = pair();
        let ack = client.submit_with_ack("once", Duration::from_secs(5));

        let correlation = server.recv().await.unwrap().correlation.unwrap();
        server.acknowledge(correlation).unwrap();
        server.acknowledge(correlation).unwrap();
        server.submit("after").unwrap();

        assert!(ack.await.is_ok());
        assert_eq!(client.recv().await.unwrap().body, "after");
        assert_eq!(client.unexpected_acks(), 1);
        assert_eq!(client.pending_acks(), 0);
        assert!(client.is_open());
        assert!(client.submit("still usable").is_ok());
    }

    #[tokio::test]
    async fn test_close_fails_pending_immediately() {
        let (client, _server) = pair();
        let ack = client.submit_with_ack("pending", Duration::ZERO);
        client.close();

        assert_eq!(ack.await, Err(TransportError::Closed));
        assert_eq!(client.closed().await, Ok(()));
        assert_eq!(client.submit("late"), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_peer_close_completes_lifecycle() {
        let (client, server) = pair();
        let ack = client.submit_with_ack("pending", Duration::ZERO);
        server.close();

        assert_eq!(client.closed().await, Err(TransportError::Disconnected));
        assert_eq!(ack.await, Err(TransportError::Disconnected));
        assert!(client.recv().await.is_none());
    }
}
