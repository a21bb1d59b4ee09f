//! Periodic full-history fetch that backs up the push channel.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ConversationId, MessageId},
    protocol::MessagePayload,
};
use tokio::{
    sync::{broadcast, Mutex, Notify},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    activity::SyncActivity, store::MessageStore, transport::MessageBackend, SyncEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Merged { changed: bool },
    /// Same size and tail as the previous fetch; merge skipped.
    Unchanged,
    /// A send or another poll was in flight.
    SkippedBusy,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: usize,
    tail: Option<MessageId>,
}

impl Fingerprint {
    fn of(messages: &[MessagePayload]) -> Self {
        Self {
            len: messages.len(),
            tail: messages.iter().map(|m| m.message_id).max(),
        }
    }
}

pub struct SnapshotPoller {
    conversation_id: ConversationId,
    store: Arc<MessageStore>,
    backend: Arc<dyn MessageBackend>,
    activity: Arc<SyncActivity>,
    events: broadcast::Sender<SyncEvent>,
    period: Duration,
    last_fingerprint: Mutex<Option<Fingerprint>>,
    wake: Notify,
}

impl SnapshotPoller {
    pub fn new(
        store: Arc<MessageStore>,
        backend: Arc<dyn MessageBackend>,
        activity: Arc<SyncActivity>,
        events: broadcast::Sender<SyncEvent>,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversation_id: store.conversation_id(),
            store,
            backend,
            activity,
            events,
            period,
            last_fingerprint: Mutex::new(None),
            wake: Notify::new(),
        })
    }

    /// One guarded fetch-and-merge cycle. Never returns an error: failures are
    /// logged and left for the next tick.
    pub async fn poll_once(&self) -> PollOutcome {
        if self.activity.sends_in_flight() > 0 {
            debug!(
                conversation_id = self.conversation_id.0,
                "poll: send in flight, skipping tick"
            );
            return PollOutcome::SkippedBusy;
        }
        let Some(_guard) = self.activity.try_begin_poll() else {
            debug!(
                conversation_id = self.conversation_id.0,
                "poll: previous poll still running, skipping tick"
            );
            return PollOutcome::SkippedBusy;
        };

        let messages = match self.backend.list_messages(self.conversation_id).await {
            Ok(messages) => messages,
            Err(error) => {
                warn!(
                    conversation_id = self.conversation_id.0,
                    %error,
                    "poll: message fetch failed; retrying next tick"
                );
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("message poll failed: {error}")));
                return PollOutcome::Failed;
            }
        };

        let fingerprint = Fingerprint::of(&messages);
        {
            let mut last = self.last_fingerprint.lock().await;
            if *last == Some(fingerprint) {
                return PollOutcome::Unchanged;
            }
            *last = Some(fingerprint);
        }

        let changed = self.store.merge_batch(messages).await;
        debug!(
            conversation_id = self.conversation_id.0,
            fetched = fingerprint.len,
            changed,
            "poll: merged snapshot"
        );
        PollOutcome::Merged { changed }
    }

    /// Runs a poll as soon as the loop is free instead of waiting for the tick.
    pub fn poll_now(&self) {
        self.wake.notify_one();
    }

    /// Starts the polling loop. The first tick fires immediately. Aborting the
    /// handle cancels the timer and abandons any fetch in flight.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(poller.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = poller.wake.notified() => {}
                }
                let outcome = poller.poll_once().await;
                debug!(
                    conversation_id = poller.conversation_id.0,
                    ?outcome,
                    "poll: tick finished"
                );
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
