use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Network,
    Storage,
    Timeout,
    Internal,
}

/// Failure of an operation the user triggered directly (send, pin, mute).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{operation} failed ({code:?}): {message}")]
pub struct OperationError {
    pub operation: String,
    pub code: ErrorCode,
    pub message: String,
}

impl OperationError {
    pub fn new(operation: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }
}
