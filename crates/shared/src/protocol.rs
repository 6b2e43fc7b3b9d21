use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, MessageId, PubKey, RowId};

/// Row-level change notifications raised by the network/storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    MessageReceived {
        row_id: RowId,
        channel_id: ChannelId,
        #[serde(default)]
        update: bool,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    UserMuted {
        channel_id: ChannelId,
        pubkey: PubKey,
        #[serde(default)]
        unmute: bool,
    },
    NicknameUpdated {
        channel_id: ChannelId,
        #[serde(default)]
        nickname: Option<String>,
    },
    PinChanged {
        channel_id: ChannelId,
        message_id: MessageId,
        pinned: bool,
    },
    ChannelUpdated {
        channel_id: ChannelId,
        #[serde(default)]
        deleted: bool,
    },
}

impl ChannelEvent {
    /// Channel the event is scoped to, if the event names one.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::MessageReceived { channel_id, .. }
            | Self::UserMuted { channel_id, .. }
            | Self::NicknameUpdated { channel_id, .. }
            | Self::PinChanged { channel_id, .. }
            | Self::ChannelUpdated { channel_id, .. } => Some(channel_id),
            Self::MessageDeleted { .. } => None,
        }
    }
}
