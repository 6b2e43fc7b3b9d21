use shared::{
    domain::{ChannelId, MessageId},
    error::OperationError,
};
use thiserror::Error;

use crate::bus::BusError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage query failed: {source:#}")]
    Storage { source: anyhow::Error },
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("no channel selected")]
    NoActiveChannel,
    #[error("message {0} is not known")]
    UnknownMessage(MessageId),
    #[error("engine event loop is already running or was shut down")]
    NotRunnable,
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl EngineError {
    pub fn storage(source: anyhow::Error) -> Self {
        Self::Storage { source }
    }
}
