//! Optimistic send: render immediately, confirm through merge.

use std::sync::Arc;

use shared::domain::CorrelationToken;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    activity::SyncActivity,
    error::SendError,
    message::DraftMessage,
    store::MessageStore,
    transport::{IdentitySource, MessageBackend},
    SyncEvent,
};

pub struct SendCoordinator {
    store: Arc<MessageStore>,
    backend: Arc<dyn MessageBackend>,
    identity: Arc<dyn IdentitySource>,
    activity: Arc<SyncActivity>,
    events: broadcast::Sender<SyncEvent>,
}

impl SendCoordinator {
    pub fn new(
        store: Arc<MessageStore>,
        backend: Arc<dyn MessageBackend>,
        identity: Arc<dyn IdentitySource>,
        activity: Arc<SyncActivity>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            backend,
            identity,
            activity,
            events,
        }
    }

    /// Inserts a provisional entry and writes it to the backend.
    ///
    /// On success the entry stays provisional until the confirmed copy is
    /// merged from push or poll. On failure it is marked failed and kept
    /// visible; nothing is resent automatically.
    pub async fn send(&self, body: &str) -> Result<CorrelationToken, SendError> {
        if body.trim().is_empty() {
            return Err(SendError::EmptyBody);
        }
        let sender_id = self
            .identity
            .current_user()
            .ok_or(SendError::NotSignedIn)?;
        let draft = DraftMessage::new(self.store.conversation_id(), sender_id, body);
        self.dispatch(draft).await
    }

    /// Sends the body of a failed entry again under a new token. The failed
    /// entry itself stays in the transcript.
    pub async fn retry(&self, token: CorrelationToken) -> Result<CorrelationToken, SendError> {
        let draft = self
            .store
            .failed_draft(token)
            .await
            .ok_or(SendError::NotRetryable(token))?;
        self.dispatch(draft).await
    }

    async fn dispatch(&self, draft: DraftMessage) -> Result<CorrelationToken, SendError> {
        let _guard = self.activity.begin_send();
        let conversation_id = draft.conversation_id;
        let token = self.store.insert_provisional(draft.clone()).await?;

        match self.backend.create_message(draft.to_request(token)).await {
            Ok(created) => {
                debug!(
                    conversation_id = conversation_id.0,
                    token = %token,
                    message_id = created.message_id.0,
                    "send: write accepted; awaiting confirmation through merge"
                );
                Ok(token)
            }
            Err(error) => {
                if self.store.is_closed().await {
                    debug!(
                        conversation_id = conversation_id.0,
                        token = %token,
                        "send: write failed after session teardown; discarding result"
                    );
                    return Err(SendError::SessionClosed);
                }
                self.store.mark_failed(token).await;
                warn!(
                    conversation_id = conversation_id.0,
                    token = %token,
                    %error,
                    "send: write failed; message marked failed"
                );
                let _ = self.events.send(SyncEvent::SendFailed {
                    token,
                    reason: error.to_string(),
                });
                Err(SendError::Write {
                    token,
                    source: error,
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
