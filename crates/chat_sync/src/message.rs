//! Transcript entry types shared by the store and its producers.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, CorrelationToken, MessageId, UserId},
    protocol::{MessagePayload, SendMessageRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Composed locally, write not yet confirmed. Rendered as "sending".
    Provisional,
    Confirmed,
    /// The write errored. Stays visible so the sender can retry.
    Failed,
}

/// Identity of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Backend(MessageId),
    Local(CorrelationToken),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    /// Server timestamp once confirmed, local compose time before that.
    pub sent_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Token of the optimistic send this entry started as, kept after promotion.
    pub origin: Option<CorrelationToken>,
    pub(crate) local_seq: u64,
}

impl Message {
    pub(crate) fn confirmed(payload: MessagePayload, local_seq: u64) -> Self {
        Self {
            key: MessageKey::Backend(payload.message_id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            body: payload.body,
            sent_at: payload.sent_at,
            status: MessageStatus::Confirmed,
            origin: None,
            local_seq,
        }
    }

    pub(crate) fn provisional(token: CorrelationToken, draft: DraftMessage, local_seq: u64) -> Self {
        Self {
            key: MessageKey::Local(token),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            body: draft.body,
            sent_at: draft.composed_at,
            status: MessageStatus::Provisional,
            origin: Some(token),
            local_seq,
        }
    }

    pub fn backend_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Backend(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }

    pub fn local_token(&self) -> Option<CorrelationToken> {
        match self.key {
            MessageKey::Local(token) => Some(token),
            MessageKey::Backend(_) => None,
        }
    }

    pub fn effective_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Provisional
    }

    pub(crate) fn sort_key(&self) -> SortKey {
        let tiebreak = match self.key {
            MessageKey::Backend(id) => Tiebreak::Backend(id),
            MessageKey::Local(_) => Tiebreak::Local(self.local_seq),
        };
        SortKey {
            at: self.sent_at,
            tiebreak,
        }
    }
}

/// Confirmed entries sort before local ones at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Tiebreak {
    Backend(MessageId),
    Local(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SortKey {
    at: DateTime<Utc>,
    tiebreak: Tiebreak,
}

/// A message composed locally, before the store assigns it a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub composed_at: DateTime<Utc>,
}

impl DraftMessage {
    pub fn new(conversation_id: ConversationId, sender_id: UserId, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            body: body.into(),
            composed_at: Utc::now(),
        }
    }

    pub fn composed_at(mut self, at: DateTime<Utc>) -> Self {
        self.composed_at = at;
        self
    }

    pub fn to_request(&self, token: CorrelationToken) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            body: self.body.clone(),
            client_nonce: Some(token),
        }
    }
}

pub(crate) fn normalize_body(body: &str) -> String {
    body.trim().replace("\r\n", "\n")
}
