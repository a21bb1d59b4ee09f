use std::path::PathBuf;

use shared::domain::{ConversationId, CorrelationToken};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conversation store has been closed")]
    Closed,
    #[error("draft for conversation {actual} does not belong to store for conversation {expected}")]
    ForeignConversation {
        expected: ConversationId,
        actual: ConversationId,
    },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("no signed-in user available to send as")]
    NotSignedIn,
    #[error("conversation session has been closed")]
    SessionClosed,
    #[error("message {0} is not a failed send and cannot be retried")]
    NotRetryable(CorrelationToken),
    #[error(transparent)]
    Store(StoreError),
    #[error("failed to write message {token}: {source}")]
    Write {
        token: CorrelationToken,
        #[source]
        source: anyhow::Error,
    },
}

impl SendError {
    /// Token of the transcript entry the failure belongs to, if one was created.
    pub fn token(&self) -> Option<CorrelationToken> {
        match self {
            SendError::Write { token, .. } => Some(*token),
            _ => None,
        }
    }
}

impl From<StoreError> for SendError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Closed => SendError::SessionClosed,
            other => SendError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push listener already subscribed for conversation {0}")]
    AlreadySubscribed(ConversationId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
