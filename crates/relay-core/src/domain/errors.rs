//! Errors - エラー型と分類

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::CorrelationId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: チャネルや下流システムの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Every failure a flow can surface to its caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    #[error("channel '{0}' is closed")]
    ChannelClosed(String),

    #[error("channel '{0}' is full")]
    ChannelFull(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("retry exhausted after {attempts} attempts: {cause}")]
    RetryExhausted { attempts: u32, cause: Box<FlowError> },

    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error("correlation group {0} expired")]
    GroupExpired(CorrelationId),

    #[error("transform failed: {0}")]
    TransformError(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("handler failed ({kind:?}): {message}")]
    Handler { kind: ErrorKind, message: String },
}

impl FlowError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Handler {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Handler {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Handler {
            kind: ErrorKind::Infrastructure,
            message: message.into(),
        }
    }

    pub fn transform(cause: impl std::fmt::Display) -> Self {
        Self::TransformError(cause.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::ChannelClosed(_) => ErrorKind::Infrastructure,
            FlowError::ChannelFull(_) | FlowError::Timeout(_) | FlowError::CircuitOpen(_) => {
                ErrorKind::Transient
            }
            FlowError::RetryExhausted { cause, .. } => cause.kind(),
            FlowError::GroupExpired(_) | FlowError::TransformError(_) | FlowError::Cancelled => {
                ErrorKind::Permanent
            }
            FlowError::Handler { kind, .. } => *kind,
        }
    }
}
