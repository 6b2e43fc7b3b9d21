use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use shared::domain::{ChannelId, Message, MessageId, MessageKind, MessageStatus, PubKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reactor {
    pub pubkey: PubKey,
    pub codeset: u8,
    pub codename: String,
    pub reaction_id: MessageId,
    pub status: MessageStatus,
}

/// Emoji to reactors, in first-reaction order per emoji.
pub type EmojiReactions = BTreeMap<String, Vec<Reactor>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LiveReaction {
    target: MessageId,
    emoji: String,
    reactor: Reactor,
}

/// Every live reaction row of one channel, keyed by its own id. The
/// per-message aggregate is derived from these rows, so rewriting or
/// hiding one row never disturbs another row by the same identity.
#[derive(Debug, Default)]
struct ChannelReactions {
    rows: HashMap<MessageId, LiveReaction>,
    /// Reaction ids per target in arrival order.
    by_target: HashMap<MessageId, Vec<MessageId>>,
}

impl ChannelReactions {
    fn aggregate(&self, target: &MessageId) -> EmojiReactions {
        let mut out = EmojiReactions::new();
        let Some(ids) = self.by_target.get(target) else {
            return out;
        };
        for row in ids.iter().filter_map(|id| self.rows.get(id)) {
            let reactors = out.entry(row.emoji.clone()).or_default();
            match reactors.iter_mut().find(|r| r.pubkey == row.reactor.pubkey) {
                // latest row wins, first position is kept
                Some(existing) => *existing = row.reactor.clone(),
                None => reactors.push(row.reactor.clone()),
            }
        }
        out
    }

    fn remove_row(&mut self, reaction_id: &MessageId) -> Option<LiveReaction> {
        let row = self.rows.remove(reaction_id)?;
        if let Some(ids) = self.by_target.get_mut(&row.target) {
            ids.retain(|id| id != reaction_id);
            if ids.is_empty() {
                self.by_target.remove(&row.target);
            }
        }
        Some(row)
    }
}

#[derive(Debug, Default)]
pub struct ReactionAggregator {
    channels: HashMap<ChannelId, ChannelReactions>,
}

impl ReactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a decoded reaction row. A row seen before under the same id
    /// is replaced, wherever it pointed. Returns false when the visible
    /// aggregate did not change.
    pub fn apply(&mut self, reaction: &Message) -> bool {
        let Some(target) = reaction.parent_id.as_ref() else {
            return false;
        };
        if reaction.kind != MessageKind::Reaction {
            return false;
        }
        if reaction.hidden {
            return self.retract(&reaction.channel_id, &reaction.id);
        }

        let next = LiveReaction {
            target: target.clone(),
            emoji: reaction.body.clone(),
            reactor: Reactor {
                pubkey: reaction.sender.pubkey.clone(),
                codeset: reaction.sender.codeset,
                codename: reaction.sender.codename.clone(),
                reaction_id: reaction.id.clone(),
                status: reaction.status,
            },
        };
        let channel = self.channels.entry(reaction.channel_id.clone()).or_default();
        if channel.rows.get(&reaction.id) == Some(&next) {
            return false;
        }

        let before = channel.aggregate(target);
        let moved_from = match channel.rows.get(&reaction.id) {
            Some(previous) if &previous.target != target => {
                let old_target = previous.target.clone();
                let old_before = channel.aggregate(&old_target);
                channel.remove_row(&reaction.id);
                Some((old_target, old_before))
            }
            _ => None,
        };
        if !channel.rows.contains_key(&reaction.id) {
            channel
                .by_target
                .entry(target.clone())
                .or_default()
                .push(reaction.id.clone());
        }
        channel.rows.insert(reaction.id.clone(), next);

        let moved_changed = moved_from
            .is_some_and(|(old_target, old_before)| channel.aggregate(&old_target) != old_before);
        moved_changed || channel.aggregate(target) != before
    }

    /// Removes the row `reaction_id`. Another live row by the same identity
    /// with the same emoji keeps that identity listed.
    pub fn retract(&mut self, channel_id: &ChannelId, reaction_id: &MessageId) -> bool {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let Some(target) = channel.rows.get(reaction_id).map(|row| row.target.clone()) else {
            return false;
        };
        let before = channel.aggregate(&target);
        channel.remove_row(reaction_id);
        channel.aggregate(&target) != before
    }

    /// Forgets every reaction aimed at `target`, e.g. once it is hidden.
    pub fn drop_target(&mut self, channel_id: &ChannelId, target: &MessageId) -> bool {
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return false;
        };
        let Some(ids) = channel.by_target.remove(target) else {
            return false;
        };
        for id in &ids {
            channel.rows.remove(id);
        }
        true
    }

    /// Replaces a channel's aggregate with one computed from `reactions`.
    /// Used on cold start and channel switch; storage is authoritative.
    pub fn rebuild<'a>(
        &mut self,
        channel_id: &ChannelId,
        reactions: impl IntoIterator<Item = &'a Message>,
    ) {
        self.forget(channel_id);
        for reaction in reactions {
            if &reaction.channel_id == channel_id {
                self.apply(reaction);
            }
        }
    }

    pub fn for_message(&self, channel_id: &ChannelId, target: &MessageId) -> EmojiReactions {
        self.channels
            .get(channel_id)
            .map(|channel| channel.aggregate(target))
            .unwrap_or_default()
    }

    pub fn for_channel(&self, channel_id: &ChannelId) -> HashMap<MessageId, EmojiReactions> {
        let Some(channel) = self.channels.get(channel_id) else {
            return HashMap::new();
        };
        channel
            .by_target
            .keys()
            .map(|target| (target.clone(), channel.aggregate(target)))
            .filter(|(_, reactions)| !reactions.is_empty())
            .collect()
    }

    pub fn forget(&mut self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
