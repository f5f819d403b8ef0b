//! Status overrides - operator-imposed status layered over local registrations

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use beacon_core::{
    BeaconError, BeaconResult, Delta, InstanceInfo, InstanceStatus, Interest, Origin, Source,
    SourceMatcher,
};
use beacon_time::DirtyClock;

use crate::holder::RegistrationStatus;
use crate::registry::{InstanceRegistry, RegistryReader};
use crate::stream::NotificationStream;

/// Registry layer applying status overrides to local registrations.
///
/// The last local registration of every instance is remembered so that an
/// override change can re-assert it with the new status and a fresh dirty
/// timestamp. Replicated copies pass through untouched.
pub struct StatusOverrides<R: ?Sized> {
    inner: Arc<R>,
    clock: Arc<DirtyClock>,
    overrides: DashMap<String, InstanceStatus>,
    registrations: DashMap<String, (InstanceInfo, Source)>,
}

impl<R: InstanceRegistry + ?Sized> StatusOverrides<R> {
    pub fn new(inner: Arc<R>, clock: Arc<DirtyClock>) -> Self {
        StatusOverrides {
            inner,
            clock,
            overrides: DashMap::new(),
            registrations: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &Arc<R> {
        &self.inner
    }

    /// Override in force for `id`, if any
    pub fn overridden_status(&self, id: &str) -> Option<InstanceStatus> {
        self.overrides.get(id).map(|s| *s)
    }

    /// Force `id` to `status` until the override is deleted
    pub fn status_update(&self, id: &str, status: InstanceStatus) -> BeaconResult<RegistrationStatus> {
        let (info, source) = self.tracked(id)?;
        self.overrides.insert(id.to_string(), status);
        info!(id, %status, "status override set");
        let stamped = info.with_status(status, self.clock.tick());
        self.inner.register(stamped, &source)
    }

    /// Drop the override of `id` and re-assert it with `new_status`
    /// (`Unknown` when not given)
    pub fn delete_status_override(
        &self,
        id: &str,
        new_status: Option<InstanceStatus>,
    ) -> BeaconResult<RegistrationStatus> {
        let (info, source) = self.tracked(id)?;
        self.overrides.remove(id);
        let status = new_status.unwrap_or(InstanceStatus::Unknown);
        info!(id, %status, "status override removed");

        let stamped = info.with_status(status, self.clock.tick());
        self.registrations
            .insert(id.to_string(), (stamped.clone(), source.clone()));
        self.inner.register(stamped, &source)
    }

    fn tracked(&self, id: &str) -> BeaconResult<(InstanceInfo, Source)> {
        // the copy may have been evicted underneath this layer
        if self.inner.get(id).is_none() {
            self.registrations.remove(id);
            return Err(BeaconError::InstanceNotFound(id.to_string()));
        }
        self.registrations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BeaconError::InstanceNotFound(id.to_string()))
    }

    fn apply(&self, info: InstanceInfo) -> InstanceInfo {
        match self.overridden_status(info.id()) {
            Some(status) if status != info.status() => {
                let timestamp = info.last_dirty_timestamp();
                info.with_status(status, timestamp)
            }
            _ => info,
        }
    }
}

impl<R: InstanceRegistry + ?Sized> RegistryReader for StatusOverrides<R> {
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

impl<R: InstanceRegistry + ?Sized> InstanceRegistry for StatusOverrides<R> {
    fn register(&self, info: InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus> {
        if source.origin() != Origin::Local {
            return self.inner.register(info, source);
        }
        self.registrations
            .insert(info.id().to_string(), (info.clone(), source.clone()));
        self.inner.register(self.apply(info), source)
    }

    fn update(
        &self,
        info: InstanceInfo,
        deltas: &[Delta],
        source: &Source,
    ) -> BeaconResult<Option<RegistrationStatus>> {
        if source.origin() != Origin::Local {
            return self.inner.update(info, deltas, source);
        }
        self.registrations
            .insert(info.id().to_string(), (info.clone(), source.clone()));
        self.inner.update(self.apply(info), deltas, source)
    }

    fn unregister(&self, info: &InstanceInfo, source: &Source) -> BeaconResult<RegistrationStatus> {
        if source.origin() == Origin::Local {
            let current = self
                .registrations
                .remove_if(info.id(), |_, (_, tracked)| tracked == source);
            if current.is_some() {
                self.overrides.remove(info.id());
            }
        }
        self.inner.unregister(info, source)
    }
}
