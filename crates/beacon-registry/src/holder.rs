//! Multi-sourced holder - one registry entry, one copy per asserting source

use std::cmp::Ordering;

use beacon_core::{ChangeNotification, InstanceInfo, Source};

/// Outcome of a single per-source mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistrationStatus {
    /// First copy for this id, the entry became visible
    AddedFirst,
    /// The effective value changed
    AddedChange,
    /// Stored, but the effective value is unchanged
    AddedNoChange,
    /// Last copy removed, the entry is gone
    RemovedLast,
    /// A copy was removed and the effective value changed
    RemovedChange,
    /// Nothing visible happened (non-effective copy, or stale source)
    RemovedNoChange,
}

impl RegistrationStatus {
    #[inline]
    pub fn is_added(self) -> bool {
        matches!(
            self,
            RegistrationStatus::AddedFirst
                | RegistrationStatus::AddedChange
                | RegistrationStatus::AddedNoChange
        )
    }

    /// Whether subscribers were notified
    #[inline]
    pub fn is_visible(self) -> bool {
        !matches!(
            self,
            RegistrationStatus::AddedNoChange | RegistrationStatus::RemovedNoChange
        )
    }
}

/// Result of mutating a holder
#[derive(Clone, Debug)]
pub struct HolderChange {
    pub status: RegistrationStatus,
    pub notification: Option<ChangeNotification>,
    /// Effective value before the mutation
    pub previous: Option<InstanceInfo>,
}

/// Copies of one entry keyed by asserter (origin and name).
///
/// INVARIANT: at most one copy per asserter; `effective` is always the
/// elected copy of `copies`, or `None` when `copies` is empty.
#[derive(Clone, Debug)]
pub struct MultiSourcedHolder {
    id: String,
    copies: Vec<(Source, InstanceInfo)>,
    effective: Option<usize>,
    /// Sequence number of the last notification this holder produced
    version: u64,
}

impl MultiSourcedHolder {
    pub fn new(id: impl Into<String>) -> Self {
        MultiSourcedHolder {
            id: id.into(),
            copies: Vec::new(),
            effective: None,
            version: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn effective(&self) -> Option<(&Source, &InstanceInfo)> {
        self.effective
            .and_then(|i| self.copies.get(i))
            .map(|(s, info)| (s, info))
    }

    /// Copy asserted by this source's asserter, any generation
    pub fn get(&self, source: &Source) -> Option<&InstanceInfo> {
        self.copies
            .iter()
            .find(|(s, _)| s.same_asserter(source))
            .map(|(_, info)| info)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.copies.iter().map(|(s, _)| s)
    }

    pub fn copies(&self) -> &[(Source, InstanceInfo)] {
        &self.copies
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Insert or replace the copy of `source`'s asserter
    pub fn update(&mut self, source: &Source, info: InstanceInfo) -> HolderChange {
        let previous = self.effective_snapshot();

        match self.copies.iter_mut().find(|(s, _)| s.same_asserter(source)) {
            Some(slot) => *slot = (source.clone(), info),
            None => self.copies.push((source.clone(), info)),
        }
        self.elect();

        self.compare(previous, true)
    }

    /// Remove the copy only if it was asserted by exactly this source generation
    pub fn remove(&mut self, source: &Source) -> HolderChange {
        let Some(index) = self.copies.iter().position(|(s, _)| s == source) else {
            return HolderChange {
                status: RegistrationStatus::RemovedNoChange,
                notification: None,
                previous: self.effective().map(|(_, info)| info.clone()),
            };
        };

        let previous = self.effective_snapshot();
        self.copies.remove(index);
        self.elect();

        self.compare(previous, false)
    }

    fn effective_snapshot(&self) -> Option<(Source, InstanceInfo)> {
        self.effective().map(|(s, info)| (s.clone(), info.clone()))
    }

    /// Highest dirty timestamp wins; ties go to the higher-priority origin,
    /// then to the larger name and generation so the choice is total.
    fn elect(&mut self) {
        self.effective = self
            .copies
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| election_order(a, b))
            .map(|(i, _)| i);
    }

    fn compare(&self, previous: Option<(Source, InstanceInfo)>, adding: bool) -> HolderChange {
        let current = self.effective();
        let (status, notification) = match (&previous, current) {
            (None, None) => (no_change(adding), None),
            (None, Some((source, info))) => (
                RegistrationStatus::AddedFirst,
                Some(ChangeNotification::add(info.clone(), source.clone())),
            ),
            (Some((prev_source, prev_info)), None) => (
                RegistrationStatus::RemovedLast,
                Some(ChangeNotification::delete(
                    prev_info.clone(),
                    prev_source.clone(),
                )),
            ),
            (Some((prev_source, prev_info)), Some((source, info))) => {
                let deltas = info.diff_older(prev_info);
                if !deltas.is_empty() || !prev_source.same_asserter(source) {
                    (
                        changed(adding),
                        Some(ChangeNotification::modify(
                            info.clone(),
                            deltas,
                            source.clone(),
                        )),
                    )
                } else {
                    (no_change(adding), None)
                }
            }
        };

        HolderChange {
            status,
            notification,
            previous: previous.map(|(_, info)| info),
        }
    }
}

fn election_order(a: &(Source, InstanceInfo), b: &(Source, InstanceInfo)) -> Ordering {
    let (sa, ia) = a;
    let (sb, ib) = b;
    ia.last_dirty_timestamp()
        .cmp(&ib.last_dirty_timestamp())
        .then_with(|| sa.origin().priority().cmp(&sb.origin().priority()))
        .then_with(|| sa.name().cmp(sb.name()))
        .then_with(|| sa.id().cmp(&sb.id()))
}

#[inline]
fn no_change(adding: bool) -> RegistrationStatus {
    if adding {
        RegistrationStatus::AddedNoChange
    } else {
        RegistrationStatus::RemovedNoChange
    }
}

#[inline]
fn changed(adding: bool) -> RegistrationStatus {
    if adding {
        RegistrationStatus::AddedChange
    } else {
        RegistrationStatus::RemovedChange
    }
}
