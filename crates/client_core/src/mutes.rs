use std::collections::{BTreeSet, HashMap};

use shared::domain::{ChannelId, PubKey};

#[derive(Debug, Default)]
struct ChannelMutes {
    muted: BTreeSet<PubKey>,
    self_muted: bool,
}

/// Muted pubkeys per channel, replaced wholesale from the channel manager.
#[derive(Debug, Default)]
pub struct MuteTracker {
    channels: HashMap<ChannelId, ChannelMutes>,
}

impl MuteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the muted set or the local flag changed.
    pub fn replace(
        &mut self,
        channel_id: &ChannelId,
        muted: impl IntoIterator<Item = PubKey>,
        self_muted: bool,
    ) -> bool {
        let next = ChannelMutes {
            muted: muted.into_iter().collect(),
            self_muted,
        };
        let entry = self.channels.entry(channel_id.clone()).or_default();
        let changed = entry.muted != next.muted || entry.self_muted != next.self_muted;
        *entry = next;
        changed
    }

    pub fn is_muted(&self, channel_id: &ChannelId, pubkey: &PubKey) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|mutes| mutes.muted.contains(pubkey))
    }

    pub fn muted(&self, channel_id: &ChannelId) -> Vec<PubKey> {
        self.channels
            .get(channel_id)
            .map(|mutes| mutes.muted.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn self_muted(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|mutes| mutes.self_muted)
    }

    pub fn forget(&mut self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
#[path = "tests/mutes_tests.rs"]
mod tests;
