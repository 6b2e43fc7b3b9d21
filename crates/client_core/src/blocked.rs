//! Buffer for replies and reactions whose parent message is not visible yet.
//!
//! Entries wait keyed by `(channel, parent id)` and are released once a
//! message with that id is admitted. Release cascades: a flushed reply can
//! itself be the parent of further buffered entries. Nothing is evicted; a
//! reply whose parent never arrives stays buffered for the session.

use std::collections::{HashMap, VecDeque};

use shared::domain::{ChannelId, Message, MessageId, MessageKind, ParentSnapshot};

#[derive(Debug, Default)]
pub struct BlockedEvents {
    pending: HashMap<(ChannelId, MessageId), Vec<Message>>,
}

impl BlockedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a decoded message.
    ///
    /// Returns the messages that became visible, in release order: the
    /// message itself first, then any descendants it unblocked. Returns an
    /// empty list when the message had to wait for its parent.
    pub fn admit<F>(&mut self, mut message: Message, mut parent_lookup: F) -> Vec<Message>
    where
        F: FnMut(&ChannelId, &MessageId) -> Option<ParentSnapshot>,
    {
        if let Some(parent_id) = message.parent_id.clone() {
            if message.kind.needs_parent() && message.replied_to.is_none() {
                match parent_lookup(&message.channel_id, &parent_id) {
                    Some(snapshot) => attach_parent(&mut message, snapshot),
                    None => {
                        self.hold(message);
                        return Vec::new();
                    }
                }
            }
        }

        let channel_id = message.channel_id.clone();
        let snapshot = message.snapshot();
        let mut released = vec![message];
        released.extend(self.release(&channel_id, snapshot));
        released
    }

    /// Releases everything waiting on `parent`, breadth-first, without
    /// releasing the parent itself. Used when a parent becomes known
    /// outside the timeline, e.g. fetched by id for reply context.
    pub fn release(&mut self, channel_id: &ChannelId, parent: ParentSnapshot) -> Vec<Message> {
        let mut released = Vec::new();
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            for mut child in self.take_children(channel_id, &parent.id) {
                attach_parent(&mut child, parent.clone());
                queue.push_back(child.snapshot());
                released.push(child);
            }
        }
        released
    }

    /// Buffers `message` under its parent id. A second copy of the same
    /// message replaces the first.
    pub fn hold(&mut self, message: Message) {
        let Some(parent_id) = message.parent_id.clone() else {
            return;
        };
        let waiting = self
            .pending
            .entry((message.channel_id.clone(), parent_id))
            .or_default();
        match waiting.iter_mut().find(|held| held.id == message.id) {
            Some(held) => *held = message,
            None => waiting.push(message),
        }
    }

    pub fn take_children(&mut self, channel_id: &ChannelId, parent_id: &MessageId) -> Vec<Message> {
        self.pending
            .remove(&(channel_id.clone(), parent_id.clone()))
            .unwrap_or_default()
    }

    /// Drops a buffered message, e.g. after it was hidden upstream.
    pub fn remove(&mut self, channel_id: &ChannelId, message_id: &MessageId) -> Option<Message> {
        let mut found = None;
        self.pending.retain(|(channel, _), waiting| {
            if channel == channel_id {
                if let Some(pos) = waiting.iter().position(|held| &held.id == message_id) {
                    found = Some(waiting.remove(pos));
                }
            }
            !waiting.is_empty()
        });
        found
    }

    pub fn contains(&self, channel_id: &ChannelId, message_id: &MessageId) -> bool {
        self.pending.iter().any(|((channel, _), waiting)| {
            channel == channel_id && waiting.iter().any(|held| &held.id == message_id)
        })
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Parent ids still missing in `channel_id`, sorted.
    pub fn waiting_parents(&self, channel_id: &ChannelId) -> Vec<MessageId> {
        let mut parents: Vec<MessageId> = self
            .pending
            .keys()
            .filter(|(channel, _)| channel == channel_id)
            .map(|(_, parent)| parent.clone())
            .collect();
        parents.sort();
        parents
    }

    pub fn clear_channel(&mut self, channel_id: &ChannelId) -> usize {
        let before = self.len();
        self.pending.retain(|(channel, _), _| channel != channel_id);
        before - self.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn attach_parent(message: &mut Message, snapshot: ParentSnapshot) {
    if message.kind == MessageKind::Reply {
        message.replied_to = Some(snapshot);
    }
}

#[cfg(test)]
#[path = "tests/blocked_tests.rs"]
mod tests;
