use std::collections::{BTreeSet, HashMap};

use shared::domain::{ChannelId, MessageId};

#[derive(Debug, Default)]
struct ChannelPins {
    previous: BTreeSet<MessageId>,
    current: BTreeSet<MessageId>,
    notified: BTreeSet<MessageId>,
}

/// Per-channel pinned sets with once-per-transition "newly pinned" detection.
///
/// An id leaving the pinned set is also dropped from the notified record,
/// so unpin followed by re-pin notifies again.
#[derive(Debug, Default)]
pub struct PinTracker {
    channels: HashMap<ChannelId, ChannelPins>,
}

impl PinTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a baseline without producing notifications. Pins that already
    /// existed at cold start are not news.
    pub fn seed(&mut self, channel_id: &ChannelId, pinned: impl IntoIterator<Item = MessageId>) {
        let set: BTreeSet<MessageId> = pinned.into_iter().collect();
        let pins = self.channels.entry(channel_id.clone()).or_default();
        pins.previous = set.clone();
        pins.notified = set.clone();
        pins.current = set;
    }

    /// Replaces the channel's pinned set with a fresh snapshot and returns the
    /// ids that should be announced, in id order.
    pub fn observe(
        &mut self,
        channel_id: &ChannelId,
        pinned: impl IntoIterator<Item = MessageId>,
    ) -> Vec<MessageId> {
        let next: BTreeSet<MessageId> = pinned.into_iter().collect();
        let pins = self.channels.entry(channel_id.clone()).or_default();
        pins.previous = std::mem::replace(&mut pins.current, next);

        let unpinned: Vec<MessageId> = pins
            .previous
            .difference(&pins.current)
            .cloned()
            .collect();
        for id in &unpinned {
            pins.notified.remove(id);
        }

        let fresh: Vec<MessageId> = pins
            .current
            .difference(&pins.previous)
            .filter(|id| !pins.notified.contains(*id))
            .cloned()
            .collect();
        pins.notified.extend(fresh.iter().cloned());
        fresh
    }

    /// Applies a single pin flag change; returns true when it is a new pin
    /// that should be announced.
    pub fn observe_change(
        &mut self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        pinned: bool,
    ) -> bool {
        let mut next = self
            .channels
            .get(channel_id)
            .map(|pins| pins.current.clone())
            .unwrap_or_default();
        if pinned {
            next.insert(message_id.clone());
        } else {
            next.remove(message_id);
        }
        !self.observe(channel_id, next).is_empty()
    }

    pub fn forget(&mut self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    pub fn pinned(&self, channel_id: &ChannelId) -> Vec<MessageId> {
        self.channels
            .get(channel_id)
            .map(|pins| pins.current.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_pinned(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|pins| pins.current.contains(message_id))
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
#[path = "tests/pins_tests.rs"]
mod tests;
