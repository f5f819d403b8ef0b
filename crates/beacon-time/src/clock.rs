//! Dirty-timestamp clock

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generator of `last_dirty_timestamp` values (milliseconds since the epoch).
/// INVARIANT: successive `tick()` results are strictly increasing, even if
/// the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct DirtyClock {
    last: AtomicU64,
}

impl DirtyClock {
    pub fn new() -> Self {
        DirtyClock {
            last: AtomicU64::new(0),
        }
    }

    /// Next timestamp: wall-clock millis, bumped past the previous value
    pub fn tick(&self) -> u64 {
        let wall = wall_millis();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Last value handed out
    pub fn now(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Make sure later ticks are greater than an externally observed timestamp
    pub fn observe(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_strictly_increase() {
        let clock = DirtyClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_future_timestamp() {
        let clock = DirtyClock::new();
        let far = wall_millis() + 60_000;
        clock.observe(far);
        assert!(clock.tick() > far);
    }
}
