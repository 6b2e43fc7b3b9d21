use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(PubKey);

/// Storage row identifier carried by change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Normal,
    Reply,
    Reaction,
    AdminText,
}

pub const TEXT_TAG: i64 = 1;
pub const ADMIN_TEXT_TAG: i64 = 2;
pub const REACTION_TAG: i64 = 3;

impl MessageKind {
    /// Maps a stored type tag onto a kind. Text rows carrying a parent are replies.
    pub fn from_tag(tag: i64, has_parent: bool) -> Option<Self> {
        match (tag, has_parent) {
            (TEXT_TAG, false) => Some(Self::Normal),
            (TEXT_TAG, true) => Some(Self::Reply),
            (ADMIN_TEXT_TAG, _) => Some(Self::AdminText),
            (REACTION_TAG, true) => Some(Self::Reaction),
            _ => None,
        }
    }

    pub fn tag(self) -> i64 {
        match self {
            Self::Normal | Self::Reply => TEXT_TAG,
            Self::AdminText => ADMIN_TEXT_TAG,
            Self::Reaction => REACTION_TAG,
        }
    }

    pub fn needs_parent(self) -> bool {
        matches!(self, Self::Reply | Self::Reaction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
}

impl MessageStatus {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(Self::Sending),
            2 => Some(Self::Sent),
            3 => Some(Self::Delivered),
            _ => None,
        }
    }

    pub fn tag(self) -> i64 {
        match self {
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
        }
    }
}

/// Position of a message inside a channel: `(timestamp, round)` ascending,
/// with the id as a final tiebreaker so distinct messages never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub timestamp_ms: i64,
    pub round: u64,
    pub id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub pubkey: PubKey,
    pub codeset: u8,
    pub codename: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSnapshot {
    pub id: MessageId,
    pub sender: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<RowId>,
    pub channel_id: ChannelId,
    pub sender: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied_to: Option<ParentSnapshot>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    pub round: u64,
    pub pinned: bool,
    pub hidden: bool,
}

impl Message {
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            timestamp_ms: self.timestamp.timestamp_millis(),
            round: self.round,
            id: self.id.clone(),
        }
    }

    pub fn snapshot(&self) -> ParentSnapshot {
        ParentSnapshot {
            id: self.id.clone(),
            sender: self.sender.clone(),
            nickname: self.nickname.clone(),
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    pub name: String,
    pub description: String,
}
