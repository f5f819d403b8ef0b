//! Interest index - fan-out of registry notifications to subscribers
//!
//! Subscriptions are split into atomic interests and each atom is filed in
//! a bucket by shape, so dispatching a notification only inspects the sinks
//! that can possibly match:
//! - `full`: full-registry subscribers
//! - `by_id` / `by_app` / `by_group` / `by_vip`: `Equals` atoms keyed by value
//! - `scan`: `Like` atoms, matched one by one

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use beacon_core::{ChangeNotification, InstanceInfo, Interest, Operator};

/// A notification stamped with the registry sequence number of its mutation
#[derive(Clone, Debug)]
pub struct Sequenced {
    pub seq: u64,
    pub notification: ChangeNotification,
}

pub(crate) type SinkSender = mpsc::UnboundedSender<Arc<Sequenced>>;
pub(crate) type SinkReceiver = mpsc::UnboundedReceiver<Arc<Sequenced>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum BucketKey {
    Full,
    Id(String),
    App(String),
    Group(String),
    Vip(String),
    Scan,
}

impl BucketKey {
    fn for_atom(atom: &Interest) -> Option<BucketKey> {
        let equals = |p: &beacon_core::Pattern| p.operator() == Operator::Equals;
        match atom {
            Interest::FullRegistry => Some(BucketKey::Full),
            Interest::Instance(p) if equals(p) => Some(BucketKey::Id(p.value().to_string())),
            Interest::Application(p) if equals(p) => Some(BucketKey::App(p.value().to_string())),
            Interest::Group(p) if equals(p) => Some(BucketKey::Group(p.value().to_string())),
            Interest::Vip(p) if equals(p) => Some(BucketKey::Vip(p.value().to_string())),
            Interest::Instance(_)
            | Interest::Application(_)
            | Interest::Group(_)
            | Interest::Vip(_) => Some(BucketKey::Scan),
            Interest::Empty | Interest::Multiple(_) => None,
        }
    }
}

struct Sink {
    subscription: u64,
    atom: Interest,
    tx: SinkSender,
}

#[derive(Default)]
struct Buckets {
    full: Vec<Sink>,
    by_id: HashMap<String, Vec<Sink>>,
    by_app: HashMap<String, Vec<Sink>>,
    by_group: HashMap<String, Vec<Sink>>,
    by_vip: HashMap<String, Vec<Sink>>,
    scan: Vec<Sink>,
}

impl Buckets {
    fn bucket_mut(&mut self, key: &BucketKey) -> &mut Vec<Sink> {
        match key {
            BucketKey::Full => &mut self.full,
            BucketKey::Scan => &mut self.scan,
            BucketKey::Id(v) => self.by_id.entry(v.clone()).or_default(),
            BucketKey::App(v) => self.by_app.entry(v.clone()).or_default(),
            BucketKey::Group(v) => self.by_group.entry(v.clone()).or_default(),
            BucketKey::Vip(v) => self.by_vip.entry(v.clone()).or_default(),
        }
    }

    fn detach(&mut self, key: &BucketKey, subscription: u64) {
        fn prune(map: &mut HashMap<String, Vec<Sink>>, value: &str, subscription: u64) {
            if let Some(sinks) = map.get_mut(value) {
                sinks.retain(|s| s.subscription != subscription);
                if sinks.is_empty() {
                    map.remove(value);
                }
            }
        }

        match key {
            BucketKey::Full => self.full.retain(|s| s.subscription != subscription),
            BucketKey::Scan => self.scan.retain(|s| s.subscription != subscription),
            BucketKey::Id(v) => prune(&mut self.by_id, v, subscription),
            BucketKey::App(v) => prune(&mut self.by_app, v, subscription),
            BucketKey::Group(v) => prune(&mut self.by_group, v, subscription),
            BucketKey::Vip(v) => prune(&mut self.by_vip, v, subscription),
        }
    }

    /// Sinks whose bucket can match `info`
    fn candidates<'a>(&'a self, info: &InstanceInfo, out: &mut Vec<&'a Sink>) {
        out.extend(self.full.iter());
        out.extend(self.scan.iter());
        let mut keyed = |map: &'a HashMap<String, Vec<Sink>>, value: Option<&str>| {
            if let Some(sinks) = value.and_then(|v| map.get(v)) {
                out.extend(sinks.iter());
            }
        };
        keyed(&self.by_id, Some(info.id()));
        keyed(&self.by_app, Some(info.app()));
        keyed(&self.by_group, info.app_group());
        keyed(&self.by_vip, info.vip_address());
    }

    fn sink_count(&self) -> usize {
        let keyed = |map: &HashMap<String, Vec<Sink>>| map.values().map(Vec::len).sum::<usize>();
        self.full.len()
            + self.scan.len()
            + keyed(&self.by_id)
            + keyed(&self.by_app)
            + keyed(&self.by_group)
            + keyed(&self.by_vip)
    }
}

/// Index of live subscriptions by interest shape
pub struct InterestIndex {
    buckets: RwLock<Buckets>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
}

impl InterestIndex {
    pub fn new() -> Self {
        InterestIndex {
            buckets: RwLock::new(Buckets::default()),
            next_subscription: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach one sink per atom of `interest`, all feeding the same channel.
    ///
    /// Every notification dispatched after this returns reaches the receiver.
    /// `Empty` attaches nothing and the receiver is already finished.
    pub(crate) fn attach(self: &Arc<Self>, interest: &Interest) -> (SinkReceiver, SubscriptionGuard) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let mut keys = Vec::new();

        {
            let mut buckets = self.buckets.write();
            if !self.closed.load(Ordering::Acquire) {
                for atom in interest.atoms() {
                    if let Some(key) = BucketKey::for_atom(atom) {
                        buckets.bucket_mut(&key).push(Sink {
                            subscription,
                            atom: atom.clone(),
                            tx: tx.clone(),
                        });
                        keys.push(key);
                    }
                }
            }
        }

        trace!(subscription, %interest, atoms = keys.len(), "subscription attached");
        (
            rx,
            SubscriptionGuard {
                index: Arc::clone(self),
                subscription,
                keys,
            },
        )
    }

    fn detach(&self, subscription: u64, keys: &[BucketKey]) {
        let mut buckets = self.buckets.write();
        for key in keys {
            buckets.detach(key, subscription);
        }
        trace!(subscription, "subscription detached");
    }

    /// Deliver a notification to every subscription it matches, once each.
    ///
    /// For a `Modify` that moves an entry out of a subscription's interest,
    /// that subscription receives a `Delete` of the previous value instead.
    pub(crate) fn dispatch(
        &self,
        seq: u64,
        notification: &ChangeNotification,
        previous: Option<&InstanceInfo>,
    ) {
        let Some(current) = notification.data() else {
            return;
        };

        let buckets = self.buckets.read();
        let mut candidates = Vec::new();
        buckets.candidates(current, &mut candidates);
        let previous = match notification {
            ChangeNotification::Modify { .. } => previous,
            _ => None,
        };
        if let Some(prev) = previous {
            buckets.candidates(prev, &mut candidates);
        }

        // subscription -> (sender, matches current value)
        let mut targets: HashMap<u64, (&SinkSender, bool)> = HashMap::new();
        for sink in candidates {
            if sink.atom.matches(current) {
                targets.insert(sink.subscription, (&sink.tx, true));
            } else if previous.is_some_and(|p| sink.atom.matches(p)) {
                targets.entry(sink.subscription).or_insert((&sink.tx, false));
            }
        }
        if targets.is_empty() {
            return;
        }

        let full = Arc::new(Sequenced {
            seq,
            notification: notification.clone(),
        });
        let mut departed = None;
        for (tx, matches_current) in targets.into_values() {
            let message = if matches_current {
                Arc::clone(&full)
            } else {
                Arc::clone(departed.get_or_insert_with(|| {
                    Arc::new(Sequenced {
                        seq,
                        notification: departed_delete(notification, previous),
                    })
                }))
            };
            // a closed receiver detaches itself on drop
            let _ = tx.send(message);
        }
    }

    /// Drop every sink; all open streams end once drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.buckets.write() = Buckets::default();
    }

    /// Number of attached sinks
    pub fn sink_count(&self) -> usize {
        self.buckets.read().sink_count()
    }
}

impl Default for InterestIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn departed_delete(
    notification: &ChangeNotification,
    previous: Option<&InstanceInfo>,
) -> ChangeNotification {
    match (notification, previous) {
        (ChangeNotification::Modify { source, .. }, Some(prev)) => {
            ChangeNotification::delete(prev.clone(), source.clone())
        }
        (other, _) => other.clone(),
    }
}

/// Detaches a subscription's sinks when dropped
pub struct SubscriptionGuard {
    index: Arc<InterestIndex>,
    subscription: u64,
    keys: Vec<BucketKey>,
}

impl SubscriptionGuard {
    pub fn subscription(&self) -> u64 {
        self.subscription
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            self.index.detach(self.subscription, &self.keys);
        }
    }
}
