//! Sourced registry - the authoritative in-memory instance store
//!
//! Holders live in a sharded map keyed by instance id. Every mutation of a
//! holder runs under its shard lock, and so do the sequence number
//! assignment and the dispatch of the resulting notification; this keeps
//! per-id changes serialized and delivered in order while unrelated ids
//! proceed in parallel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, trace};

use beacon_core::{
    BeaconError, BeaconResult, Delta, InstanceInfo, Interest, Source, SourceMatcher,
};

use crate::holder::{HolderChange, MultiSourcedHolder, RegistrationStatus};
use crate::index::InterestIndex;
use crate::stream::NotificationStream;

/// Query half of the registry contract
pub trait RegistryReader: Send + Sync {
    /// Live subscription: matching snapshot first, then every matching change
    fn for_interest(&self, interest: &Interest) -> NotificationStream {
        self.for_interest_sourced(interest, SourceMatcher::Any)
    }

    /// Live subscription restricted to entries whose effective source matches
    fn for_interest_sourced(&self, interest: &Interest, matcher: SourceMatcher) -> NotificationStream;

    /// One-shot snapshot of the matching effective values
    fn for_snapshot(&self, interest: &Interest) -> Vec<InstanceInfo> {
        self.for_snapshot_sourced(interest, &SourceMatcher::Any)
    }

    fn for_snapshot_sourced(&self, interest: &Interest, matcher: &SourceMatcher) -> Vec<InstanceInfo>;

    /// Effective value and source of one entry
    fn get_sourced(&self, id: &str) -> Option<(InstanceInfo, Source)>;

    fn get(&self, id: &str) -> Option<InstanceInfo> {
        self.get_sourced(id).map(|(info, _)| info)
    }

    /// The copy held by exactly this source generation, effective or not
    fn copy_of(&self, id: &str, source: &Source) -> Option<InstanceInfo>;

    /// Number of entries (holders), not copies
    fn size(&self) -> usize;
}

/// Full registry contract: queries plus per-source mutations
pub trait InstanceRegistry: RegistryReader {
    /// Insert or replace `source`'s copy of `info`
    fn register(&self, info: InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus>;

    /// Like `register` for a value known to differ from the stored one by
    /// `deltas`; `None` when there is no entry to update
    fn update(
        &self,
        info: InstanceInfo,
        deltas: &[Delta],
        source: &Source,
    ) -> BeaconResult<Option<RegistrationStatus>>;

    /// Remove `source`'s copy (exact generation) of the entry
    fn unregister(&self, info: &InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus>;
}

/// Diagnostic view of one holder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HolderSummary {
    pub id: String,
    pub effective_source: Option<Source>,
    pub copies: usize,
}

/// Local in-memory registry
pub struct SourcedRegistry {
    holders: DashMap<String, MultiSourcedHolder>,
    index: Arc<InterestIndex>,
    sequence: AtomicU64,
    shutdown: AtomicBool,
}

impl SourcedRegistry {
    pub fn new() -> Self {
        SourcedRegistry {
            holders: DashMap::new(),
            index: Arc::new(InterestIndex::new()),
            sequence: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> BeaconResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BeaconError::RegistryShutdown);
        }
        Ok(())
    }

    /// Stamp and fan out a holder change. Called with the holder's shard locked.
    fn publish(&self, holder: &mut MultiSourcedHolder, change: &HolderChange) {
        if let Some(notification) = &change.notification {
            let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            holder.set_version(seq);
            trace!(id = holder.id(), seq, kind = ?notification.kind(), "publishing change");
            self.index
                .dispatch(seq, notification, change.previous.as_ref());
        }
    }

    fn upsert(&self, info: InstanceInfo, source: &Source) -> RegistrationStatus {
        match self.holders.entry(info.id().to_string()) {
            Entry::Occupied(mut entry) => {
                let holder = entry.get_mut();
                let change = holder.update(source, info);
                self.publish(holder, &change);
                change.status
            }
            Entry::Vacant(entry) => {
                let mut holder = MultiSourcedHolder::new(info.id());
                let change = holder.update(source, info);
                self.publish(&mut holder, &change);
                entry.insert(holder);
                change.status
            }
        }
    }

    fn remove_copy(&self, id: &str, source: &Source) -> RegistrationStatus {
        match self.holders.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let holder = entry.get_mut();
                let change = holder.remove(source);
                self.publish(holder, &change);
                if holder.is_empty() {
                    entry.remove();
                }
                change.status
            }
            Entry::Vacant(_) => {
                debug!(id, source = %source, "unregister for unknown instance ignored");
                RegistrationStatus::RemovedNoChange
            }
        }
    }

    /// Remove every copy whose source does not satisfy `keep`; returns the number removed
    fn evict_where(&self, keep: impl Fn(&Source) -> bool) -> usize {
        let ids: Vec<String> = self.holders.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;

        for id in ids {
            let Entry::Occupied(mut entry) = self.holders.entry(id) else {
                continue;
            };
            let doomed: Vec<Source> = entry
                .get()
                .sources()
                .filter(|s| !keep(s))
                .cloned()
                .collect();
            for source in doomed {
                let holder = entry.get_mut();
                let change = holder.remove(&source);
                self.publish(holder, &change);
                removed += 1;
            }
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        removed
    }

    /// Remove every copy from every source
    pub fn evict_all(&self) -> usize {
        let removed = self.evict_where(|_| false);
        info!(removed, "evicted all registry entries");
        removed
    }

    /// Remove every copy whose source does not match `retain`
    pub fn evict_all_except(&self, retain: &SourceMatcher) -> usize {
        let removed = self.evict_where(|s| retain.matches(s));
        info!(removed, "evicted registry entries outside retained sources");
        removed
    }

    /// Every stored copy asserted by a source matching `matcher`
    pub fn copies_matching(&self, matcher: &SourceMatcher) -> Vec<(InstanceInfo, Source)> {
        self.holders
            .iter()
            .flat_map(|entry| {
                entry
                    .copies()
                    .iter()
                    .filter(|(s, _)| matcher.matches(s))
                    .map(|(s, info)| (info.clone(), s.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn holders(&self) -> Vec<HolderSummary> {
        self.holders
            .iter()
            .map(|entry| HolderSummary {
                id: entry.key().clone(),
                effective_source: entry.effective().map(|(s, _)| s.clone()),
                copies: entry.size(),
            })
            .collect()
    }

    /// Number of live subscription sinks
    pub fn subscriber_count(&self) -> usize {
        self.index.sink_count()
    }

    /// End every subscription and drop all entries
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.index.close();
        self.holders.clear();
        info!("registry shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Default for SourcedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryReader for SourcedRegistry {
    fn for_interest_sourced(&self, interest: &Interest, matcher: SourceMatcher) -> NotificationStream {
        if self.is_shutdown() {
            return NotificationStream::closed();
        }

        // Attach first, then read the floor: anything stamped at or below the
        // floor is reflected in the snapshot read afterwards
        let (rx, guard) = self.index.attach(interest);
        let floor = self.sequence.load(Ordering::Acquire);

        let snapshot: Vec<(InstanceInfo, Source, u64)> = self
            .holders
            .iter()
            .filter_map(|entry| {
                let (source, info) = entry.effective()?;
                (interest.matches(info) && matcher.matches(source))
                    .then(|| (info.clone(), source.clone(), entry.version()))
            })
            .collect();

        debug!(%interest, snapshot = snapshot.len(), floor, "subscription opened");
        NotificationStream::new(snapshot, rx, guard, floor, matcher)
    }

    fn for_snapshot_sourced(&self, interest: &Interest, matcher: &SourceMatcher) -> Vec<InstanceInfo> {
        self.holders
            .iter()
            .filter_map(|entry| {
                let (source, info) = entry.effective()?;
                (interest.matches(info) && matcher.matches(source)).then(|| info.clone())
            })
            .collect()
    }

    fn get_sourced(&self, id: &str) -> Option<(InstanceInfo, Source)> {
        let holder = self.holders.get(id)?;
        holder
            .effective()
            .map(|(source, info)| (info.clone(), source.clone()))
    }

    fn copy_of(&self, id: &str, source: &Source) -> Option<InstanceInfo> {
        let holder = self.holders.get(id)?;
        holder
            .copies()
            .iter()
            .find(|(s, _)| s == source)
            .map(|(_, info)| info.clone())
    }

    fn size(&self) -> usize {
        self.holders.len()
    }
}

impl InstanceRegistry for SourcedRegistry {
    fn register(&self, info: InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus> {
        self.ensure_running()?;
        let id = info.id().to_string();
        let status = self.upsert(info, source);
        debug!(id = %id, source = %source, ?status, "register");
        Ok(status)
    }

    fn update(
        &self,
        info: InstanceInfo,
        deltas: &[Delta],
        source: &Source,
    ) -> BeaconResult<Option<RegistrationStatus>> {
        self.ensure_running()?;
        let id = info.id().to_string();
        let Some(mut holder) = self.holders.get_mut(&id) else {
            debug!(id = %id, source = %source, "update for unknown instance ignored");
            return Ok(None);
        };
        let change = holder.update(source, info);
        self.publish(&mut holder, &change);
        debug!(id = %id, source = %source, deltas = deltas.len(), status = ?change.status, "update");
        Ok(Some(change.status))
    }

    fn unregister(&self, info: &InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus> {
        self.ensure_running()?;
        let status = self.remove_copy(info.id(), source);
        debug!(id = info.id(), source = %source, ?status, "unregister");
        Ok(status)
    }
}

/// Query-only view over any registry
pub struct ReadOnlyRegistry<R: ?Sized> {
    inner: Arc<R>,
}

impl<R: RegistryReader + ?Sized> ReadOnlyRegistry<R> {
    pub fn new(inner: Arc<R>) -> Self {
        ReadOnlyRegistry { inner }
    }
}

impl<R: ?Sized> Clone for ReadOnlyRegistry<R> {
    fn clone(&self) -> Self {
        ReadOnlyRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RegistryReader + ?Sized> RegistryReader for ReadOnlyRegistry<R> {
    fn for_interest_sourced(&self, interest: &Interest, matcher: SourceMatcher) -> NotificationStream {
        self.inner.for_interest_sourced(interest, matcher)
    }

    fn for_snapshot_sourced(&self, interest: &Interest, matcher: &SourceMatcher) -> Vec<InstanceInfo> {
        self.inner.for_snapshot_sourced(interest, matcher)
    }

    fn get_sourced(&self, id: &str) -> Option<(InstanceInfo, Source)> {
        self.inner.get_sourced(id)
    }

    fn copy_of(&self, id: &str, source: &Source) -> Option<InstanceInfo> {
        self.inner.copy_of(id, source)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{BufferMarker, ChangeNotification, InstanceStatus, NotificationKind, Origin};
    use std::thread;

    fn info(id: &str, app: &str, ts: u64) -> InstanceInfo {
        InstanceInfo::builder(id)
            .app(app)
            .status(InstanceStatus::Up)
            .last_dirty_timestamp(ts)
            .build()
            .unwrap()
    }

    fn drain(stream: &mut NotificationStream) -> Vec<ChangeNotification> {
        std::iter::from_fn(|| stream.try_next()).collect()
    }

    #[test]
    fn test_register_and_query() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");

        let status = registry.register(info("i-1", "billing", 1), &local).unwrap();
        assert_eq!(status, RegistrationStatus::AddedFirst);
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("i-1").unwrap().app(), "billing");
        assert_eq!(
            registry
                .for_snapshot(&Interest::for_application("billing"))
                .len(),
            1
        );
        assert!(registry.for_snapshot(&Interest::Empty).is_empty());
    }

    #[test]
    fn test_update_unknown_is_noop() {
        let registry = SourcedRegistry::new();
        let outcome = registry
            .update(info("ghost", "app", 1), &[], &Source::local("c"))
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn test_unregister_last_removes_holder() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");
        let peer = Source::replicated("peer");
        let i1 = info("i-1", "app", 1);

        registry.register(i1.clone(), &local).unwrap();
        registry.register(i1.clone(), &peer).unwrap();
        assert_eq!(
            registry.unregister(&i1, &local).unwrap(),
            RegistrationStatus::RemovedChange
        );
        assert_eq!(
            registry.unregister(&i1, &peer).unwrap(),
            RegistrationStatus::RemovedLast
        );
        assert_eq!(registry.size(), 0);
        assert!(registry.holders().is_empty());
    }

    #[test]
    fn test_subscription_snapshot_then_live() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");
        for id in ["a", "b", "c"] {
            registry.register(info(id, "app", 1), &local).unwrap();
        }

        let mut stream = registry.for_interest(&Interest::FullRegistry);
        registry.register(info("d", "app", 1), &local).unwrap();

        let events = drain(&mut stream);
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], ChangeNotification::BufferSentinel(BufferMarker::Start));
        assert_eq!(events[4], ChangeNotification::BufferSentinel(BufferMarker::End));
        assert_eq!(events[5].kind(), NotificationKind::Add);
        assert_eq!(events[5].id(), Some("d"));
    }

    #[test]
    fn test_single_entry_snapshot_has_no_sentinels() {
        let registry = SourcedRegistry::new();
        registry
            .register(info("a", "app", 1), &Source::local("c"))
            .unwrap();

        let mut stream = registry.for_interest(&Interest::for_instance("a"));
        let events = drain(&mut stream);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), NotificationKind::Add);
    }

    #[test]
    fn test_concurrent_subscribe_sees_every_entry_once() {
        let registry = Arc::new(SourcedRegistry::new());
        let local = Source::local("client");
        for i in 0..3 {
            registry
                .register(info(&format!("pre-{i}"), "app", 1), &local)
                .unwrap();
        }

        let writer = {
            let registry = registry.clone();
            let local = local.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    registry
                        .register(info(&format!("live-{i}"), "app", 1), &local)
                        .unwrap();
                }
            })
        };
        let mut stream = registry.for_interest(&Interest::FullRegistry);
        writer.join().unwrap();

        let mut seen = std::collections::HashSet::new();
        for event in drain(&mut stream) {
            if let Some(id) = event.id() {
                assert_eq!(event.kind(), NotificationKind::Add);
                assert!(seen.insert(id.to_string()), "duplicate {id}");
            }
        }
        assert_eq!(seen.len(), 203);
    }

    #[test]
    fn test_non_winning_mutation_not_notified() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");
        let peer = Source::replicated("peer");
        registry.register(info("i-1", "app", 10), &local).unwrap();

        let mut stream = registry.for_interest(&Interest::FullRegistry);
        drain(&mut stream);

        registry.register(info("i-1", "app", 5), &peer).unwrap();
        registry.unregister(&info("i-1", "app", 5), &peer).unwrap();
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_delete_of_unseen_entry_dropped() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");

        let mut stream = registry.for_interest(&Interest::for_application("billing"));
        registry.register(info("x", "other", 1), &local).unwrap();
        registry.unregister(&info("x", "other", 1), &local).unwrap();
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_sourced_subscription_sees_handover_as_delete() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");
        let peer = Source::replicated("peer");
        registry.register(info("i-1", "app", 1), &local).unwrap();

        let mut stream = registry.for_interest_sourced(
            &Interest::FullRegistry,
            SourceMatcher::Origin(Origin::Local),
        );
        assert_eq!(stream.try_next().unwrap().kind(), NotificationKind::Add);

        // a newer replicated copy takes over the entry
        registry.register(info("i-1", "app", 9), &peer).unwrap();
        assert_eq!(stream.try_next().unwrap().kind(), NotificationKind::Delete);
    }

    #[test]
    fn test_evict_all_except() {
        let registry = SourcedRegistry::new();
        let local = Source::local("client");
        let peer = Source::replicated("peer");
        registry.register(info("a", "app", 1), &local).unwrap();
        registry.register(info("b", "app", 1), &peer).unwrap();
        registry.register(info("a", "app", 1), &peer).unwrap();

        let removed = registry.evict_all_except(&SourceMatcher::Origin(Origin::Local));
        assert_eq!(removed, 2);
        assert_eq!(registry.size(), 1);
        assert!(registry.get("b").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let registry = SourcedRegistry::new();
        let mut stream = registry.for_interest(&Interest::FullRegistry);
        assert_eq!(registry.subscriber_count(), 1);

        registry.shutdown();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            registry.register(info("a", "app", 1), &Source::local("c")),
            Err(BeaconError::RegistryShutdown)
        ));
    }

    #[test]
    fn test_dropped_stream_detaches() {
        let registry = SourcedRegistry::new();
        let stream = registry.for_interest(&Interest::for_application("billing"));
        assert_eq!(registry.subscriber_count(), 1);
        drop(stream);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_read_only_view() {
        let registry = Arc::new(SourcedRegistry::new());
        registry
            .register(info("a", "app", 1), &Source::local("c"))
            .unwrap();
        let view = ReadOnlyRegistry::new(registry.clone());
        assert_eq!(view.size(), 1);
        assert!(view.get("a").is_some());
    }
}
