//! Change notifications
//!
//! Typed registry change events delivered to subscribers. Data-bearing
//! notifications carry the effective source of the entry; buffer sentinels
//! carry nothing and delimit a batch that must be applied as a unit.

use crate::{Delta, InstanceInfo, Source};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Add,
    Modify,
    Delete,
    BufferSentinel,
}

/// Batch boundary marker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferMarker {
    Start,
    End,
}

/// A registry change as seen by a subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeNotification {
    Add {
        data: InstanceInfo,
        source: Source,
    },
    Modify {
        data: InstanceInfo,
        deltas: Vec<Delta>,
        source: Source,
    },
    Delete {
        data: InstanceInfo,
        source: Source,
    },
    BufferSentinel(BufferMarker),
}

impl ChangeNotification {
    pub fn add(data: InstanceInfo, source: Source) -> Self {
        ChangeNotification::Add { data, source }
    }

    pub fn modify(data: InstanceInfo, deltas: Vec<Delta>, source: Source) -> Self {
        ChangeNotification::Modify {
            data,
            deltas,
            source,
        }
    }

    pub fn delete(data: InstanceInfo, source: Source) -> Self {
        ChangeNotification::Delete { data, source }
    }

    pub fn buffer_start() -> Self {
        ChangeNotification::BufferSentinel(BufferMarker::Start)
    }

    pub fn buffer_end() -> Self {
        ChangeNotification::BufferSentinel(BufferMarker::End)
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            ChangeNotification::Add { .. } => NotificationKind::Add,
            ChangeNotification::Modify { .. } => NotificationKind::Modify,
            ChangeNotification::Delete { .. } => NotificationKind::Delete,
            ChangeNotification::BufferSentinel(_) => NotificationKind::BufferSentinel,
        }
    }

    pub fn data(&self) -> Option<&InstanceInfo> {
        match self {
            ChangeNotification::Add { data, .. }
            | ChangeNotification::Modify { data, .. }
            | ChangeNotification::Delete { data, .. } => Some(data),
            ChangeNotification::BufferSentinel(_) => None,
        }
    }

    pub fn source(&self) -> Option<&Source> {
        match self {
            ChangeNotification::Add { source, .. }
            | ChangeNotification::Modify { source, .. }
            | ChangeNotification::Delete { source, .. } => Some(source),
            ChangeNotification::BufferSentinel(_) => None,
        }
    }

    /// Deltas of a `Modify`, empty for every other kind
    pub fn deltas(&self) -> &[Delta] {
        match self {
            ChangeNotification::Modify { deltas, .. } => deltas,
            _ => &[],
        }
    }

    /// Id of the entry this notification is about
    pub fn id(&self) -> Option<&str> {
        self.data().map(InstanceInfo::id)
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        !matches!(self, ChangeNotification::BufferSentinel(_))
    }

    /// Same change reported as an `Add`, used when a subscriber first learns of an entry
    pub fn into_add(self) -> Self {
        match self {
            ChangeNotification::Modify { data, source, .. } => ChangeNotification::Add { data, source },
            other => other,
        }
    }
}
