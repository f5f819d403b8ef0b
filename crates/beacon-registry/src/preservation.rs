//! Preservable registry - eviction with self-preservation
//!
//! Wraps a `SourcedRegistry` and owns its eviction queue. It tracks the
//! registry size it expects from explicit registrations and cancellations
//! only; evictions do not lower it, so a mass disconnect shows up as a drop
//! below the expected size and the eviction strategy can halt it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info};

use beacon_core::{BeaconResult, Delta, InstanceInfo, Interest, Source, SourceMatcher};

use crate::eviction::{EvictionConfig, EvictionQueue, EvictionStrategy, EvictionTarget};
use crate::holder::RegistrationStatus;
use crate::registry::{HolderSummary, InstanceRegistry, RegistryReader, SourcedRegistry};
use crate::stream::NotificationStream;

struct Preservation {
    registry: Arc<SourcedRegistry>,
    strategy: EvictionStrategy,
    expected_size: AtomicUsize,
    resume: Arc<Notify>,
}

impl Preservation {
    fn on_registered(&self, status: RegistrationStatus) {
        if status == RegistrationStatus::AddedFirst {
            let size = self.registry.size();
            self.expected_size.fetch_max(size, Ordering::AcqRel);
            self.resume.notify_waiters();
        }
    }

    fn on_unregistered(&self, status: RegistrationStatus) {
        if status == RegistrationStatus::RemovedLast {
            let _ = self
                .expected_size
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                });
            self.resume.notify_waiters();
        }
    }
}

impl EvictionTarget for Preservation {
    fn evict(&self, info: &InstanceInfo, source: &Source) {
        // bypasses the expected-size bookkeeping
        match self.registry.unregister(info, source) {
            Ok(status) => debug!(id = info.id(), source = %source, ?status, "eviction applied"),
            Err(e) => debug!(id = info.id(), source = %source, error = %e, "eviction skipped"),
        }
    }

    fn allowed_to_evict(&self) -> bool {
        self.strategy.allowed_to_evict(
            self.expected_size.load(Ordering::Acquire),
            self.registry.size(),
        )
    }

    fn resume_signal(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.resume))
    }
}

/// Registry variant that routes disconnect cleanup through an eviction queue
pub struct PreservableRegistry {
    core: Arc<Preservation>,
    evictions: EvictionQueue,
}

impl PreservableRegistry {
    /// Wrap `registry` and start its eviction worker on the current runtime
    pub fn new(registry: Arc<SourcedRegistry>, config: &EvictionConfig) -> Self {
        let core = Arc::new(Preservation {
            registry,
            strategy: config.strategy,
            expected_size: AtomicUsize::new(0),
            resume: Arc::new(Notify::new()),
        });
        let evictions = EvictionQueue::start(config.timeout, core.clone());
        PreservableRegistry { core, evictions }
    }

    pub fn inner(&self) -> &Arc<SourcedRegistry> {
        &self.core.registry
    }

    pub fn eviction_queue(&self) -> &EvictionQueue {
        &self.evictions
    }

    /// Schedule delayed removal of `source`'s copy
    pub fn schedule_eviction(&self, info: InstanceInfo, source: Source) {
        self.evictions.add(info, source);
    }

    pub fn expected_size(&self) -> usize {
        self.core.expected_size.load(Ordering::Acquire)
    }

    pub fn is_in_self_preservation(&self) -> bool {
        self.evictions.is_in_self_preservation()
    }

    /// Leave self preservation if the strategy now allows it
    pub fn resume(&self) {
        self.core.resume.notify_waiters();
    }

    /// Hand every copy whose source does not match `retain` to the eviction queue
    pub fn evict_all_except(&self, retain: &SourceMatcher) -> usize {
        let doomed = self.core.registry.copies_matching(&SourceMatcher::Any);
        let mut scheduled = 0;
        for (info, source) in doomed {
            if !retain.matches(&source) {
                self.evictions.add(info, source);
                scheduled += 1;
            }
        }
        info!(scheduled, "scheduled eviction of copies outside retained sources");
        scheduled
    }

    pub fn holders(&self) -> Vec<HolderSummary> {
        self.core.registry.holders()
    }

    pub fn shutdown(&self) {
        self.evictions.shutdown();
        self.core.registry.shutdown();
    }
}

impl RegistryReader for PreservableRegistry {
    fn for_interest_sourced(&self, interest: &Interest, matcher: SourceMatcher) -> NotificationStream {
        self.core.registry.for_interest_sourced(interest, matcher)
    }

    fn for_snapshot_sourced(&self, interest: &Interest, matcher: &SourceMatcher) -> Vec<InstanceInfo> {
        self.core.registry.for_snapshot_sourced(interest, matcher)
    }

    fn get_sourced(&self, id: &str) -> Option<(InstanceInfo, Source)> {
        self.core.registry.get_sourced(id)
    }

    fn copy_of(&self, id: &str, source: &Source) -> Option<InstanceInfo> {
        self.core.registry.copy_of(id, source)
    }

    fn size(&self) -> usize {
        self.core.registry.size()
    }
}

impl InstanceRegistry for PreservableRegistry {
    fn register(&self, info: InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus> {
        let status = self.core.registry.register(info, source)?;
        self.core.on_registered(status);
        Ok(status)
    }

    fn update(
        &self,
        info: InstanceInfo,
        deltas: &[Delta],
        source: &Source,
    ) -> BeaconResult<Option<RegistrationStatus>> {
        self.core.registry.update(info, deltas, source)
    }

    fn unregister(&self, info: &InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus> {
        let status = self.core.registry.unregister(info, source)?;
        self.core.on_unregistered(status);
        Ok(status)
    }
}
