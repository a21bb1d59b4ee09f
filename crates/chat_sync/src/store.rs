//! In-memory transcript of one conversation.
//!
//! Every producer (push listener, snapshot poller, send coordinator) funnels
//! through [`MessageStore`]. Mutations take the single write lock, so a reader
//! only ever sees the state between two complete operations.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::{
    domain::{ConversationId, CorrelationToken, MessageId, UserId},
    protocol::MessagePayload,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    message::{normalize_body, DraftMessage, Message, MessageKey, MessageStatus},
};

/// Consistent copy of the transcript at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CorrelationState {
    Outstanding,
    Failed,
}

#[derive(Debug, Clone)]
struct Correlation {
    sender_id: UserId,
    normalized_body: String,
    composed_at: DateTime<Utc>,
    local_seq: u64,
    state: CorrelationState,
}

#[derive(Default)]
struct TranscriptState {
    entries: Vec<Message>,
    confirmed_ids: HashSet<MessageId>,
    correlations: HashMap<CorrelationToken, Correlation>,
    next_seq: u64,
    revision: u64,
    closed: bool,
}

impl TranscriptState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn position_of(&self, key: MessageKey) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.sort_key();
        let index = self.entries.partition_point(|entry| entry.sort_key() < key);
        self.entries.insert(index, message);
    }

    /// Exact nonce match first, then the outstanding entry whose content
    /// matches within `window` and whose compose time is closest to the
    /// server timestamp. Equal distances go to the older entry.
    fn find_correlation(
        &self,
        payload: &MessagePayload,
        window: ChronoDuration,
    ) -> Option<CorrelationToken> {
        if let Some(nonce) = payload.client_nonce {
            if self.correlations.contains_key(&nonce) {
                return Some(nonce);
            }
        }

        let body = normalize_body(&payload.body);
        self.correlations
            .iter()
            .filter(|(_, c)| {
                c.state == CorrelationState::Outstanding
                    && c.sender_id == payload.sender_id
                    && c.normalized_body == body
                    && (payload.sent_at - c.composed_at).abs() <= window
            })
            .min_by_key(|(_, c)| ((payload.sent_at - c.composed_at).abs(), c.local_seq))
            .map(|(token, _)| *token)
    }

    fn merge_one(&mut self, payload: MessagePayload, window: ChronoDuration) -> bool {
        let message_id = payload.message_id;
        if self.confirmed_ids.contains(&message_id) {
            debug!(message_id = message_id.0, "merge: duplicate message ignored");
            return false;
        }

        match self.find_correlation(&payload, window) {
            Some(token) => {
                self.correlations.remove(&token);
                let local_seq = match self.position_of(MessageKey::Local(token)) {
                    Some(index) => self.entries.remove(index).local_seq,
                    None => self.take_seq(),
                };
                let mut confirmed = Message::confirmed(payload, local_seq);
                confirmed.origin = Some(token);
                debug!(
                    message_id = message_id.0,
                    token = %token,
                    "merge: provisional message promoted"
                );
                self.insert_sorted(confirmed);
            }
            None => {
                let seq = self.take_seq();
                self.insert_sorted(Message::confirmed(payload, seq));
            }
        }

        self.confirmed_ids.insert(message_id);
        true
    }
}

pub struct MessageStore {
    conversation_id: ConversationId,
    correlation_window: ChronoDuration,
    state: RwLock<TranscriptState>,
    revisions: watch::Sender<u64>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, correlation_window: std::time::Duration) -> Self {
        let (revisions, _) = watch::channel(0);
        Self {
            conversation_id,
            correlation_window: ChronoDuration::from_std(correlation_window)
                .unwrap_or(ChronoDuration::MAX),
            state: RwLock::new(TranscriptState::default()),
            revisions,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Receiver that observes the revision after every visible change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    fn publish(&self, state: &mut TranscriptState) {
        state.revision += 1;
        self.revisions.send_replace(state.revision);
    }

    /// Merges confirmed messages from the poller or the push channel.
    ///
    /// Returns `true` when the visible transcript changed. Applying the same
    /// messages again, or in another order, converges on the same transcript.
    pub async fn merge_batch(&self, candidates: Vec<MessagePayload>) -> bool {
        if candidates.is_empty() {
            return false;
        }

        let mut candidates: Vec<MessagePayload> = candidates
            .into_iter()
            .filter(|payload| {
                if payload.conversation_id != self.conversation_id {
                    warn!(
                        conversation_id = self.conversation_id.0,
                        foreign_conversation_id = payload.conversation_id.0,
                        message_id = payload.message_id.0,
                        "merge: dropping message addressed to another conversation"
                    );
                    return false;
                }
                true
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.sent_at
                .cmp(&b.sent_at)
                .then(a.message_id.cmp(&b.message_id))
        });

        let mut state = self.state.write().await;
        if state.closed {
            return false;
        }

        let mut changed = false;
        for payload in candidates {
            changed |= state.merge_one(payload, self.correlation_window);
        }
        if changed {
            self.publish(&mut state);
        }
        changed
    }

    /// Adds a locally composed message and registers its correlation token.
    pub async fn insert_provisional(
        &self,
        draft: DraftMessage,
    ) -> Result<CorrelationToken, StoreError> {
        if draft.conversation_id != self.conversation_id {
            return Err(StoreError::ForeignConversation {
                expected: self.conversation_id,
                actual: draft.conversation_id,
            });
        }

        let mut state = self.state.write().await;
        if state.closed {
            return Err(StoreError::Closed);
        }

        let token = CorrelationToken::new();
        let seq = state.take_seq();
        state.correlations.insert(
            token,
            Correlation {
                sender_id: draft.sender_id,
                normalized_body: normalize_body(&draft.body),
                composed_at: draft.composed_at,
                local_seq: seq,
                state: CorrelationState::Outstanding,
            },
        );
        state.insert_sorted(Message::provisional(token, draft, seq));
        self.publish(&mut state);
        Ok(token)
    }

    /// Moves a provisional entry to `Failed`. Returns `false` for unknown,
    /// already confirmed or already failed tokens.
    pub async fn mark_failed(&self, token: CorrelationToken) -> bool {
        let mut state = self.state.write().await;
        if state.closed {
            return false;
        }
        let Some(index) = state.position_of(MessageKey::Local(token)) else {
            return false;
        };
        if state.entries[index].status != MessageStatus::Provisional {
            return false;
        }

        state.entries[index].status = MessageStatus::Failed;
        if let Some(correlation) = state.correlations.get_mut(&token) {
            correlation.state = CorrelationState::Failed;
        }
        self.publish(&mut state);
        true
    }

    pub async fn snapshot(&self) -> Transcript {
        let state = self.state.read().await;
        Transcript {
            conversation_id: self.conversation_id,
            revision: state.revision,
            messages: state.entries.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current entry for a token, following it through promotion.
    pub async fn get(&self, token: CorrelationToken) -> Option<Message> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .find(|entry| entry.origin == Some(token))
            .cloned()
    }

    /// Draft to resend for a failed entry.
    pub async fn failed_draft(&self, token: CorrelationToken) -> Option<DraftMessage> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .find(|entry| {
                entry.key == MessageKey::Local(token) && entry.status == MessageStatus::Failed
            })
            .map(|entry| DraftMessage::new(entry.conversation_id, entry.sender_id, entry.body.clone()))
    }

    /// Tokens still waiting for their confirmed copy.
    pub async fn outstanding_tokens(&self) -> Vec<CorrelationToken> {
        let state = self.state.read().await;
        let mut outstanding: Vec<(u64, CorrelationToken)> = state
            .correlations
            .iter()
            .filter(|(_, c)| c.state == CorrelationState::Outstanding)
            .map(|(token, c)| (c.local_seq, *token))
            .collect();
        outstanding.sort_unstable_by_key(|(seq, _)| *seq);
        outstanding.into_iter().map(|(_, token)| token).collect()
    }

    /// Discards the store. Later mutations are ignored; reads keep working.
    pub async fn close(&self) {
        self.state.write().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
