//! Live push subscription for one conversation.
//!
//! ```text
//! Disconnected -> Subscribing -> Subscribed -> Disconnected   (teardown)
//!                      |             |
//!                      v             v
//!                 Reconnecting <-> Subscribed                 (transport drop)
//! ```
//!
//! Reconnecting keeps every merged message; the snapshot poller fills
//! whatever was missed while the channel was down.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{domain::ConversationId, error::ApiException, protocol::PushEvent};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::PushError,
    store::MessageStore,
    transport::{PushFrame, PushStream, PushTransport},
    SyncEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushState {
    Disconnected,
    Subscribing,
    Subscribed,
    Reconnecting,
}

impl PushState {
    pub fn can_transition_to(self, next: PushState) -> bool {
        use PushState::*;
        matches!(
            (self, next),
            (Disconnected, Subscribing)
                | (Subscribing, Subscribed)
                | (Subscribing, Reconnecting)
                | (Subscribed, Reconnecting)
                | (Reconnecting, Subscribed)
                | (_, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

struct ListenerShared {
    conversation_id: ConversationId,
    store: Arc<MessageStore>,
    transport: Arc<dyn PushTransport>,
    events: broadcast::Sender<SyncEvent>,
    state: watch::Sender<PushState>,
    policy: ReconnectPolicy,
}

impl ListenerShared {
    fn transition(&self, next: PushState) -> bool {
        let mut previous = None;
        let moved = self.state.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                previous = Some(*current);
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });

        if moved {
            info!(
                conversation_id = self.conversation_id.0,
                from = ?previous,
                to = ?next,
                "push: state changed"
            );
            let _ = self.events.send(SyncEvent::PushStateChanged(next));
        } else if previous != Some(next) {
            debug!(
                conversation_id = self.conversation_id.0,
                from = ?previous,
                to = ?next,
                "push: ignoring invalid state transition"
            );
        }
        moved
    }

    async fn run(self: Arc<Self>) {
        let mut delay = self.policy.initial_delay;
        loop {
            match self.transport.subscribe(self.conversation_id).await {
                Ok(stream) => {
                    if self.drain(stream).await {
                        delay = self.policy.initial_delay;
                    }
                }
                Err(error) => {
                    warn!(
                        conversation_id = self.conversation_id.0,
                        %error,
                        "push: subscribe failed"
                    );
                }
            }

            if !self.transition(PushState::Reconnecting)
                && *self.state.borrow() == PushState::Disconnected
            {
                return;
            }
            warn!(
                conversation_id = self.conversation_id.0,
                delay_ms = delay.as_millis() as u64,
                "push: channel dropped; reconnecting"
            );
            tokio::time::sleep(delay).await;
            delay = self.policy.next_delay(delay);
        }
    }

    /// Consumes one subscription until it drops. Returns whether it ever
    /// reached `Subscribed`.
    async fn drain(&self, mut stream: PushStream) -> bool {
        let mut subscribed = false;
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(PushFrame::Opened) => {
                    subscribed |= self.transition(PushState::Subscribed)
                        || *self.state.borrow() == PushState::Subscribed;
                    continue;
                }
                Ok(PushFrame::Text(text)) => text,
                Err(error) => {
                    warn!(
                        conversation_id = self.conversation_id.0,
                        %error,
                        "push: transport error"
                    );
                    return subscribed;
                }
            };

            match serde_json::from_str::<PushEvent>(&text) {
                Ok(PushEvent::Subscribed { conversation_id })
                    if conversation_id == self.conversation_id =>
                {
                    subscribed |= self.transition(PushState::Subscribed)
                        || *self.state.borrow() == PushState::Subscribed;
                }
                Ok(PushEvent::Subscribed { conversation_id }) => {
                    warn!(
                        conversation_id = self.conversation_id.0,
                        acknowledged = conversation_id.0,
                        "push: subscription acknowledged for another conversation"
                    );
                }
                Ok(PushEvent::MessageInserted { message }) => {
                    let message_id = message.message_id;
                    let changed = self.store.merge_batch(vec![message]).await;
                    debug!(
                        conversation_id = self.conversation_id.0,
                        message_id = message_id.0,
                        changed,
                        "push: insert event merged"
                    );
                }
                Ok(PushEvent::Closed { reason }) => {
                    info!(
                        conversation_id = self.conversation_id.0,
                        reason = reason.as_deref().unwrap_or("none"),
                        "push: channel closed by server"
                    );
                    return subscribed;
                }
                Ok(PushEvent::Error(api_error)) => {
                    let error = ApiException::from(api_error);
                    warn!(
                        conversation_id = self.conversation_id.0,
                        transient = error.code.is_transient(),
                        %error,
                        "push: channel errored"
                    );
                    let _ = self
                        .events
                        .send(SyncEvent::Error(format!("push channel error: {error}")));
                    return subscribed;
                }
                Err(error) => {
                    warn!(
                        conversation_id = self.conversation_id.0,
                        %error,
                        "push: dropping malformed event"
                    );
                    let _ = self
                        .events
                        .send(SyncEvent::Error(format!("invalid push event: {error}")));
                }
            }
        }
        subscribed
    }
}

/// Owns at most one live subscription for its conversation.
pub struct PushListener {
    shared: Arc<ListenerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushListener {
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<dyn PushTransport>,
        events: broadcast::Sender<SyncEvent>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(PushState::Disconnected);
        Self {
            shared: Arc::new(ListenerShared {
                conversation_id: store.conversation_id(),
                store,
                transport,
                events,
                state,
                policy,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PushState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PushState> {
        self.shared.state.subscribe()
    }

    pub async fn start(&self) -> Result<(), PushError> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(PushError::AlreadySubscribed(self.shared.conversation_id));
        }

        self.shared.transition(PushState::Subscribing);
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(shared.run()));
        Ok(())
    }

    /// Unsubscribes. Safe to call when not running.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.shared.transition(PushState::Disconnected);
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
