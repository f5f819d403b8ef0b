//! Eviction queue - delayed removal of a vanished source's copies
//!
//! When a client connection or replication channel disappears without
//! cleaning up, its copies are not removed at once: each one is scheduled
//! here and removed only after the grace period. A source that comes back
//! in time re-asserts its copies under a new generation, which turns the
//! pending removal into a no-op at execution time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use beacon_core::{InstanceInfo, Source};
use beacon_time::DeadlineQueue;

/// Default grace period before a disconnected source's copies are removed
pub const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Guard against mass eviction after a large-scale disconnect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Always evict
    Unlimited,
    /// Stop evicting once the registry shrank by more than this many
    /// percent below its expected size
    PercentageDrop(u8),
}

impl EvictionStrategy {
    pub fn allowed_to_evict(&self, expected_size: usize, current_size: usize) -> bool {
        match *self {
            EvictionStrategy::Unlimited => true,
            EvictionStrategy::PercentageDrop(percent) => {
                let percent = usize::from(percent.min(100));
                let tolerated = expected_size * percent / 100;
                current_size + tolerated >= expected_size
            }
        }
    }
}

impl Default for EvictionStrategy {
    fn default() -> Self {
        EvictionStrategy::PercentageDrop(20)
    }
}

/// Eviction queue configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionConfig {
    pub timeout: Duration,
    pub strategy: EvictionStrategy,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        EvictionConfig {
            timeout: DEFAULT_EVICTION_TIMEOUT,
            strategy: EvictionStrategy::default(),
        }
    }
}

/// A scheduled removal of one source's copy
#[derive(Clone, Debug)]
pub struct EvictionTask {
    pub info: InstanceInfo,
    pub source: Source,
    pub expiry: Instant,
}

/// What the queue evicts from
pub trait EvictionTarget: Send + Sync + 'static {
    /// Remove the copy. Must be a no-op if `source` is no longer the
    /// generation holding the copy.
    fn evict(&self, info: &InstanceInfo, source: &Source);

    /// Whether one more eviction may proceed now
    fn allowed_to_evict(&self) -> bool {
        true
    }

    /// Signalled when a refused eviction may be retried
    fn resume_signal(&self) -> Option<Arc<Notify>> {
        None
    }
}

struct QueueInner {
    queue: DeadlineQueue<EvictionTask>,
    timeout: Duration,
    preserving: AtomicBool,
    evicted: AtomicU64,
    shutdown: Notify,
}

/// Delayed-eviction queue with a single worker task
#[derive(Clone)]
pub struct EvictionQueue {
    inner: Arc<QueueInner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EvictionQueue {
    /// Start the worker on the current tokio runtime
    pub fn start(timeout: Duration, target: Arc<dyn EvictionTarget>) -> Self {
        let inner = Arc::new(QueueInner {
            queue: DeadlineQueue::new(),
            timeout,
            preserving: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            shutdown: Notify::new(),
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&inner), target));

        EvictionQueue {
            inner,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Schedule removal of `source`'s copy of `info` after the grace period
    pub fn add(&self, info: InstanceInfo, source: Source) {
        if self.inner.queue.is_closed() {
            debug!(id = info.id(), source = %source, "eviction queue closed, task dropped");
            return;
        }
        let expiry = Instant::now() + self.inner.timeout;
        debug!(id = info.id(), source = %source, timeout = ?self.inner.timeout, "eviction scheduled");
        self.inner.queue.push(
            EvictionTask {
                info,
                source,
                expiry,
            },
            expiry,
        );
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Tasks not yet executed
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Total number of evictions executed
    pub fn evicted(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }

    pub fn is_in_self_preservation(&self) -> bool {
        self.inner.preserving.load(Ordering::Acquire)
    }

    /// Stop the worker; pending tasks are discarded
    pub fn shutdown(&self) {
        self.inner.queue.close();
        self.inner.shutdown.notify_waiters();
        let dropped = self.inner.queue.drain().len();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        info!(dropped, "eviction queue shut down");
    }
}

async fn run_worker(inner: Arc<QueueInner>, target: Arc<dyn EvictionTarget>) {
    while let Some(batch) = inner.queue.wait_expired().await {
        let mut batch: VecDeque<EvictionTask> = batch.into();

        while let Some(task) = batch.pop_front() {
            let resume = target.resume_signal();
            let resumed = resume.as_ref().map(|n| n.notified());

            if !target.allowed_to_evict() {
                if !inner.preserving.swap(true, Ordering::AcqRel) {
                    warn!(pending = batch.len() + 1, "entering self preservation mode");
                }
                // park the refused tasks until the registry grows back
                let parked = std::iter::once(task).chain(batch.drain(..));
                for task in parked {
                    let expiry = task.expiry;
                    inner.queue.push(task, expiry);
                }

                let shutdown = inner.shutdown.notified();
                match resumed {
                    Some(resumed) => {
                        tokio::select! {
                            _ = resumed => {}
                            _ = shutdown => return,
                            _ = tokio::time::sleep(inner.timeout) => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = shutdown => return,
                            _ = tokio::time::sleep(inner.timeout) => {}
                        }
                    }
                }
                break;
            }

            if inner.preserving.swap(false, Ordering::AcqRel) {
                info!("leaving self preservation mode");
            }
            target.evict(&task.info, &task.source);
            inner.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(id = task.info.id(), source = %task.source, "evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::InstanceStatus;

    #[derive(Default)]
    struct Recorder {
        evicted: Mutex<Vec<String>>,
        refuse: AtomicBool,
        resume: Arc<Notify>,
    }

    impl EvictionTarget for Recorder {
        fn evict(&self, info: &InstanceInfo, _source: &Source) {
            self.evicted.lock().push(info.id().to_string());
        }

        fn allowed_to_evict(&self) -> bool {
            !self.refuse.load(Ordering::Acquire)
        }

        fn resume_signal(&self) -> Option<Arc<Notify>> {
            Some(self.resume.clone())
        }
    }

    fn info(id: &str) -> InstanceInfo {
        InstanceInfo::builder(id)
            .app("app")
            .status(InstanceStatus::Up)
            .build()
            .unwrap()
    }

    #[test]
    fn test_percentage_drop() {
        let strategy = EvictionStrategy::PercentageDrop(20);
        assert!(strategy.allowed_to_evict(10, 10));
        assert!(strategy.allowed_to_evict(10, 8));
        assert!(!strategy.allowed_to_evict(10, 7));
        assert!(strategy.allowed_to_evict(1, 1));
        assert!(!strategy.allowed_to_evict(1, 0));
        assert!(EvictionStrategy::Unlimited.allowed_to_evict(100, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_after_grace_period() {
        let target = Arc::new(Recorder::default());
        let queue = EvictionQueue::start(Duration::from_secs(30), target.clone());

        queue.add(info("a"), Source::local("c"));
        queue.add(info("b"), Source::local("c"));
        assert_eq!(queue.pending(), 2);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(target.evicted.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*target.evicted.lock(), vec!["a", "b"]);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.evicted(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_preservation_parks_tasks() {
        let target = Arc::new(Recorder::default());
        target.refuse.store(true, Ordering::Release);
        let queue = EvictionQueue::start(Duration::from_secs(1), target.clone());

        queue.add(info("a"), Source::local("c"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(queue.is_in_self_preservation());
        assert_eq!(queue.pending(), 1);
        assert!(target.evicted.lock().is_empty());

        target.refuse.store(false, Ordering::Release);
        target.resume.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queue.is_in_self_preservation());
        assert_eq!(*target.evicted.lock(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_pending() {
        let target = Arc::new(Recorder::default());
        let queue = EvictionQueue::start(Duration::from_secs(5), target.clone());
        queue.add(info("a"), Source::local("c"));

        queue.shutdown();
        assert_eq!(queue.pending(), 0);
        queue.add(info("b"), Source::local("c"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(target.evicted.lock().is_empty());
    }
}
