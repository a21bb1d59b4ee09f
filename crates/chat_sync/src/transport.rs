//! Seams to the collaborators the engine does not own: the message backend,
//! the live push channel, profile lookup and the signed-in identity.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{MessagePayload, ProfileSummary, SendMessageRequest},
};

#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// Full current history of a conversation, in any order.
    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>>;
    async fn create_message(&self, request: SendMessageRequest) -> Result<MessagePayload>;
}

/// Transport-level frame from a push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    /// The underlying connection is up.
    Opened,
    Text(String),
}

/// Ends when the transport closes. An `Err` item is a transport failure.
pub type PushStream = BoxStream<'static, Result<PushFrame>>;

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(&self, conversation_id: ConversationId) -> Result<PushStream>;
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn lookup(&self, user_id: UserId) -> Result<Option<ProfileSummary>>;
}

pub trait IdentitySource: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
}

pub struct StaticIdentity(pub UserId);

impl IdentitySource for StaticIdentity {
    fn current_user(&self) -> Option<UserId> {
        Some(self.0)
    }
}

pub struct SignedOut;

impl IdentitySource for SignedOut {
    fn current_user(&self) -> Option<UserId> {
        None
    }
}
