use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::domain::{Identity, Message, MessageKind, MessageStatus};
use storage::MessageRow;
use thiserror::Error;

/// Longest reaction payload accepted, in characters.
pub const MAX_REACTION_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decrypt payload: {0}")]
    Decrypt(String),
    #[error("unknown message type tag {tag}")]
    UnknownKind { tag: i64 },
    #[error("unknown message status tag {tag}")]
    UnknownStatus { tag: i64 },
    #[error("reaction payload is empty")]
    EmptyReaction,
    #[error("reaction payload has {0} characters")]
    ReactionTooLong(usize),
}

/// Session decryption primitive owned by the network layer.
pub trait Cipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Treats stored text as base64-encoded UTF-8.
pub struct PassthroughCipher;

impl PassthroughCipher {
    pub fn encode(plaintext: &str) -> String {
        STANDARD.encode(plaintext.as_bytes())
    }
}

impl Cipher for PassthroughCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(ciphertext.as_bytes())
            .context("invalid base64 payload")?;
        String::from_utf8(bytes).map_err(|err| anyhow!("payload is not utf-8: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    AdminText(String),
    Reaction(String),
}

impl Content {
    pub fn into_body(self) -> String {
        match self {
            Self::Text(body) | Self::AdminText(body) | Self::Reaction(body) => body,
        }
    }
}

#[derive(Clone)]
pub struct MessageCodec {
    cipher: Arc<dyn Cipher>,
}

impl MessageCodec {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self { cipher }
    }

    pub fn decode(&self, ciphertext: &str, kind: MessageKind) -> Result<Content, CodecError> {
        let plaintext = self
            .cipher
            .decrypt(ciphertext)
            .map_err(|err| CodecError::Decrypt(format!("{err:#}")))?;
        match kind {
            MessageKind::Normal | MessageKind::Reply => Ok(Content::Text(plaintext)),
            MessageKind::AdminText => Ok(Content::AdminText(plaintext)),
            MessageKind::Reaction => {
                let emoji = plaintext.trim();
                let len = emoji.chars().count();
                if len == 0 {
                    Err(CodecError::EmptyReaction)
                } else if len > MAX_REACTION_LEN {
                    Err(CodecError::ReactionTooLong(len))
                } else {
                    Ok(Content::Reaction(emoji.to_string()))
                }
            }
        }
    }

    /// Turns a stored row into a decoded message. The reply snapshot is left
    /// empty; the blocked-event buffer fills it in once the parent is visible.
    pub fn decode_row(&self, row: &MessageRow, sender: Identity) -> Result<Message, CodecError> {
        let kind = MessageKind::from_tag(row.type_tag, row.parent_message_id.is_some())
            .ok_or(CodecError::UnknownKind { tag: row.type_tag })?;
        let status = MessageStatus::from_tag(row.status_tag)
            .ok_or(CodecError::UnknownStatus { tag: row.status_tag })?;
        let body = self.decode(&row.text, kind)?.into_body();
        Ok(Message {
            id: row.message_id.clone(),
            row_id: Some(row.row_id),
            channel_id: row.channel_id.clone(),
            sender,
            nickname: row.nickname.clone().filter(|nick| !nick.is_empty()),
            body,
            kind,
            parent_id: row.parent_message_id.clone(),
            replied_to: None,
            status,
            timestamp: row.timestamp,
            round: row.round,
            pinned: row.pinned,
            hidden: row.hidden,
        })
    }
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
