use std::sync::Arc;

use shared::domain::{ConversationId, CorrelationToken};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::info;

use crate::{
    activity::SyncActivity,
    config::SyncSettings,
    error::{PushError, SendError},
    poller::SnapshotPoller,
    push::{PushListener, PushState, ReconnectPolicy},
    send::SendCoordinator,
    store::{MessageStore, Transcript},
    transport::{IdentitySource, MessageBackend, PushTransport},
    SyncEvent,
};

/// External collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDependencies {
    pub backend: Arc<dyn MessageBackend>,
    pub push: Arc<dyn PushTransport>,
    pub identity: Arc<dyn IdentitySource>,
}

/// One open conversation view: owns the transcript and the tasks feeding it.
pub struct ConversationSession {
    conversation_id: ConversationId,
    store: Arc<MessageStore>,
    poller: Arc<SnapshotPoller>,
    listener: PushListener,
    coordinator: SendCoordinator,
    events: broadcast::Sender<SyncEvent>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    pub async fn open(
        settings: &SyncSettings,
        conversation_id: ConversationId,
        deps: SessionDependencies,
    ) -> Result<Arc<Self>, PushError> {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let store = Arc::new(MessageStore::new(
            conversation_id,
            settings.correlation_window,
        ));
        let activity = SyncActivity::new();

        let poller = SnapshotPoller::new(
            Arc::clone(&store),
            Arc::clone(&deps.backend),
            Arc::clone(&activity),
            events.clone(),
            settings.poll_interval,
        );
        let listener = PushListener::new(
            Arc::clone(&store),
            deps.push,
            events.clone(),
            ReconnectPolicy {
                initial_delay: settings.reconnect_initial_delay,
                max_delay: settings.reconnect_max_delay,
            },
        );
        let coordinator = SendCoordinator::new(
            Arc::clone(&store),
            deps.backend,
            deps.identity,
            activity,
            events.clone(),
        );

        listener.start().await?;
        let poll_task = poller.spawn();
        info!(conversation_id = conversation_id.0, "session: opened");

        Ok(Arc::new(Self {
            conversation_id,
            store,
            poller,
            listener,
            coordinator,
            events,
            poll_task: Mutex::new(Some(poll_task)),
        }))
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn snapshot(&self) -> Transcript {
        self.store.snapshot().await
    }

    pub fn watch_transcript(&self) -> watch::Receiver<u64> {
        self.store.watch()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn push_state(&self) -> PushState {
        self.listener.state()
    }

    pub fn watch_push_state(&self) -> watch::Receiver<PushState> {
        self.listener.watch_state()
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub async fn send(&self, body: &str) -> Result<CorrelationToken, SendError> {
        let token = self.coordinator.send(body).await?;
        self.refresh_without_push();
        Ok(token)
    }

    pub async fn retry(&self, token: CorrelationToken) -> Result<CorrelationToken, SendError> {
        let token = self.coordinator.retry(token).await?;
        self.refresh_without_push();
        Ok(token)
    }

    /// Without a live channel the confirmation would wait a full poll period.
    fn refresh_without_push(&self) {
        if self.listener.state() != PushState::Subscribed {
            self.poller.poll_now();
        }
    }

    /// Tears the view down: stops polling, unsubscribes push and discards the
    /// transcript. Sends still in flight finish but no longer touch it.
    pub async fn close(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        self.listener.stop().await;
        if !self.store.is_closed().await {
            self.store.close().await;
            info!(conversation_id = self.conversation_id.0, "session: closed");
        }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
