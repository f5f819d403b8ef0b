//! Deadline queue
//!
//! Items are ordered by deadline and handed out in batches once expired.
//! There is exactly one consumer, and it keeps at most one timer armed: the
//! instant it is sleeping towards is published in `next_wakeup`, and a
//! producer whose item is due sooner lowers it with a compare-and-swap and
//! wakes the consumer so it re-arms for the new head.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

const NO_WAKEUP: u64 = u64::MAX;

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed: BinaryHeap is a max-heap, the earliest deadline must be on top
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Time-ordered queue with a single-flight wakeup
pub struct DeadlineQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    seq: AtomicU64,
    /// Nanoseconds since `origin` the consumer is currently sleeping towards
    next_wakeup: AtomicU64,
    origin: Instant,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        DeadlineQueue {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            next_wakeup: AtomicU64::new(NO_WAKEUP),
            origin: Instant::now(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn offset(&self, deadline: Instant) -> u64 {
        deadline.saturating_duration_since(self.origin).as_nanos() as u64
    }

    /// Schedule `item` for `deadline`
    pub fn push(&self, item: T, deadline: Instant) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Entry {
            deadline,
            seq,
            item,
        });

        // Move the single outstanding wakeup earlier if this item is due sooner
        let target = self.offset(deadline);
        let mut current = self.next_wakeup.load(Ordering::Acquire);
        while target < current {
            match self.next_wakeup.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.notify.notify_one();
                    break;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Schedule `item` for `now + delay`
    pub fn push_after(&self, item: T, delay: Duration) {
        self.push(item, Instant::now() + delay);
    }

    /// Remove and return every item due at or before `now`, earliest first
    pub fn pop_expired(&self, now: Instant) -> Vec<T> {
        let mut heap = self.heap.lock();
        Self::drain_due(&mut heap, now)
    }

    fn drain_due(heap: &mut BinaryHeap<Entry<T>>, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while heap.peek().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = heap.pop() {
                due.push(entry.item);
            }
        }
        due
    }

    /// Wait until at least one item is due and return the whole due batch.
    ///
    /// Returns `None` once the queue is closed. Must only be called from a
    /// single consumer task.
    pub async fn wait_expired(&self) -> Option<Vec<T>> {
        loop {
            let notified = self.notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            let next = {
                let mut heap = self.heap.lock();
                let due = Self::drain_due(&mut heap, Instant::now());
                if !due.is_empty() {
                    return Some(due);
                }
                let next = heap.peek().map(|e| e.deadline);
                // Published under the heap lock so a concurrent push either
                // lands in `next` or sees this value and lowers it
                self.next_wakeup.store(
                    next.map_or(NO_WAKEUP, |d| self.offset(d)),
                    Ordering::Release,
                );
                next
            };

            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Deadline of the earliest item
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Remove every item regardless of deadline
    pub fn drain(&self) -> Vec<T> {
        let mut heap = self.heap.lock();
        let mut items: Vec<Entry<T>> = heap.drain().collect();
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|e| e.item).collect()
    }

    /// Stop the consumer; `wait_expired` returns `None` from now on
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
