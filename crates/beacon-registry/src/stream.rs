//! Notification stream - buffered snapshot followed by the live tail

use std::collections::{HashMap, VecDeque};

use beacon_core::{ChangeNotification, InstanceInfo, Source, SourceMatcher};

use crate::index::{SinkReceiver, SubscriptionGuard};

/// Live subscription to registry changes.
///
/// The stream first yields the snapshot captured at subscription time
/// (wrapped in buffer sentinels when it holds more than one entry), then
/// every later matching change. Live events already reflected by the
/// snapshot are dropped, as are deletes of entries this subscriber never
/// saw. Dropping the stream detaches it from the registry.
pub struct NotificationStream {
    buffered: VecDeque<ChangeNotification>,
    rx: Option<SinkReceiver>,
    /// Highest sequence number assigned before the snapshot was taken
    floor: u64,
    /// Entries this subscriber currently holds, with the last sequence seen
    known: HashMap<String, u64>,
    matcher: SourceMatcher,
    _guard: Option<SubscriptionGuard>,
}

impl NotificationStream {
    pub(crate) fn new(
        snapshot: Vec<(InstanceInfo, Source, u64)>,
        rx: SinkReceiver,
        guard: SubscriptionGuard,
        floor: u64,
        matcher: SourceMatcher,
    ) -> Self {
        let mut known = HashMap::with_capacity(snapshot.len());
        let batch = snapshot.len() > 1;
        let mut buffered = VecDeque::with_capacity(snapshot.len() + 2);

        if batch {
            buffered.push_back(ChangeNotification::buffer_start());
        }
        for (info, source, version) in snapshot {
            known.insert(info.id().to_string(), version);
            buffered.push_back(ChangeNotification::add(info, source));
        }
        if batch {
            buffered.push_back(ChangeNotification::buffer_end());
        }

        NotificationStream {
            buffered,
            rx: Some(rx),
            floor,
            known,
            matcher,
            _guard: Some(guard),
        }
    }

    /// A stream that has already ended
    pub fn closed() -> Self {
        NotificationStream {
            buffered: VecDeque::new(),
            rx: None,
            floor: 0,
            known: HashMap::new(),
            matcher: SourceMatcher::Any,
            _guard: None,
        }
    }

    /// Next notification, or `None` once the registry shut down
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        if let Some(buffered) = self.buffered.pop_front() {
            return Some(buffered);
        }
        loop {
            let sequenced = self.rx.as_mut()?.recv().await?;
            if let Some(n) = self.admit(sequenced.seq, &sequenced.notification) {
                return Some(n);
            }
        }
    }

    /// Next notification if one is ready, without waiting
    pub fn try_next(&mut self) -> Option<ChangeNotification> {
        if let Some(buffered) = self.buffered.pop_front() {
            return Some(buffered);
        }
        loop {
            let sequenced = self.rx.as_mut()?.try_recv().ok()?;
            if let Some(n) = self.admit(sequenced.seq, &sequenced.notification) {
                return Some(n);
            }
        }
    }

    /// Decide what, if anything, a live event means to this subscriber
    fn admit(&mut self, seq: u64, notification: &ChangeNotification) -> Option<ChangeNotification> {
        if seq <= self.floor {
            return None;
        }
        let id = notification.id()?;
        let held = self.known.get(id).copied();
        if held.is_some_and(|last| seq <= last) {
            return None;
        }

        let source_matches = notification
            .source()
            .is_some_and(|s| self.matcher.matches(s));

        match notification {
            ChangeNotification::Delete { .. } => {
                held?;
                self.known.remove(id);
                Some(notification.clone())
            }
            ChangeNotification::Add { data, source }
            | ChangeNotification::Modify { data, source, .. }
                if !source_matches =>
            {
                // the entry is now asserted by a source outside this view
                held?;
                self.known.remove(id);
                Some(ChangeNotification::delete(data.clone(), source.clone()))
            }
            _ => {
                self.known.insert(id.to_string(), seq);
                match held {
                    Some(_) => Some(notification.clone()),
                    None => Some(notification.clone().into_add()),
                }
            }
        }
    }
}
