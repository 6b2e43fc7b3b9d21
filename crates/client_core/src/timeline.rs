use std::collections::{BTreeMap, HashMap};

use shared::domain::{ChannelId, Message, MessageId, OrderKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// Same id and sort position; content replaced in place.
    Updated,
    /// Same id, but timestamp or round changed so the entry was re-sorted.
    Moved,
}

/// One channel's visible messages ordered by `(timestamp, round, id)`.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: BTreeMap<OrderKey, Message>,
    index: HashMap<MessageId, OrderKey>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, message: Message) -> Upsert {
        let key = message.order_key();
        match self.index.get(&message.id) {
            Some(existing) if *existing == key => {
                self.entries.insert(key, message);
                Upsert::Updated
            }
            Some(existing) => {
                let stale = existing.clone();
                self.entries.remove(&stale);
                self.index.insert(message.id.clone(), key.clone());
                self.entries.insert(key, message);
                Upsert::Moved
            }
            None => {
                self.index.insert(message.id.clone(), key.clone());
                self.entries.insert(key, message);
                Upsert::Inserted
            }
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        let key = self.index.get(id)?;
        self.entries.get_mut(key)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Position of `id` in chronological order.
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        let key = self.index.get(id)?;
        Some(self.entries.range(..key).count())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    /// Messages in `[start, end)` by chronological position.
    pub fn slice(&self, start: usize, end: usize) -> Vec<Message> {
        self.entries
            .values()
            .skip(start)
            .take(end.saturating_sub(start))
            .cloned()
            .collect()
    }

    pub fn first_key(&self) -> Option<&OrderKey> {
        self.entries.keys().next()
    }

    pub fn last_key(&self) -> Option<&OrderKey> {
        self.entries.keys().next_back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All loaded channels. Switching channels never drops another channel's
/// timeline.
#[derive(Debug, Default)]
pub struct Timelines {
    channels: HashMap<ChannelId, Timeline>,
}

impl Timelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<&Timeline> {
        self.channels.get(channel_id)
    }

    pub fn channel_mut(&mut self, channel_id: &ChannelId) -> &mut Timeline {
        self.channels.entry(channel_id.clone()).or_default()
    }

    pub fn get(&self, channel_id: &ChannelId, id: &MessageId) -> Option<&Message> {
        self.channels.get(channel_id)?.get(id)
    }

    /// Finds the channel holding `id`; deletion events carry no channel.
    pub fn locate(&self, id: &MessageId) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, timeline)| timeline.contains(id))
            .map(|(channel_id, _)| channel_id.clone())
    }

    pub fn drop_channel(&mut self, channel_id: &ChannelId) -> Option<Timeline> {
        self.channels.remove(channel_id)
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.channels.keys()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
