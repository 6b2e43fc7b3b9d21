use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{ChannelId, MessageId, PubKey};

/// Imperative channel operations owned by the network layer. The engine
/// only forwards calls and reports their outcome.
#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// Returns the network-assigned id of the new message.
    async fn send_message(&self, channel_id: &ChannelId, body: &str) -> Result<MessageId>;
    async fn send_reply(
        &self,
        channel_id: &ChannelId,
        parent_id: &MessageId,
        body: &str,
    ) -> Result<MessageId>;
    async fn send_reaction(
        &self,
        channel_id: &ChannelId,
        target_id: &MessageId,
        emoji: &str,
    ) -> Result<MessageId>;
    async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        unpin: bool,
    ) -> Result<()>;
    async fn delete_message(&self, channel_id: &ChannelId, message_id: &MessageId) -> Result<()>;
    async fn mute_user(&self, channel_id: &ChannelId, pubkey: &PubKey, unmute: bool)
        -> Result<()>;
    async fn muted_users(&self, channel_id: &ChannelId) -> Result<Vec<PubKey>>;
    /// Whether the local identity is muted in `channel_id`.
    async fn is_muted(&self, channel_id: &ChannelId) -> Result<bool>;
}

pub struct MissingChannelManager;

#[async_trait]
impl ChannelManager for MissingChannelManager {
    async fn send_message(&self, channel_id: &ChannelId, _body: &str) -> Result<MessageId> {
        Err(anyhow!("channel manager unavailable for channel {channel_id}"))
    }

    async fn send_reply(
        &self,
        channel_id: &ChannelId,
        _parent_id: &MessageId,
        _body: &str,
    ) -> Result<MessageId> {
        Err(anyhow!("channel manager unavailable for channel {channel_id}"))
    }

    async fn send_reaction(
        &self,
        channel_id: &ChannelId,
        _target_id: &MessageId,
        _emoji: &str,
    ) -> Result<MessageId> {
        Err(anyhow!("channel manager unavailable for channel {channel_id}"))
    }

    async fn pin_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        _unpin: bool,
    ) -> Result<()> {
        Err(anyhow!(
            "channel manager unavailable for channel {channel_id} message {message_id}"
        ))
    }

    async fn delete_message(&self, channel_id: &ChannelId, message_id: &MessageId) -> Result<()> {
        Err(anyhow!(
            "channel manager unavailable for channel {channel_id} message {message_id}"
        ))
    }

    async fn mute_user(
        &self,
        channel_id: &ChannelId,
        _pubkey: &PubKey,
        _unmute: bool,
    ) -> Result<()> {
        Err(anyhow!("channel manager unavailable for channel {channel_id}"))
    }

    async fn muted_users(&self, channel_id: &ChannelId) -> Result<Vec<PubKey>> {
        Err(anyhow!("channel manager unavailable for channel {channel_id}"))
    }

    async fn is_muted(&self, channel_id: &ChannelId) -> Result<bool> {
        Err(anyhow!("channel manager unavailable for channel {channel_id}"))
    }
}
