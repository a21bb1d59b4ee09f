//! In-memory collaborators shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{MessagePayload, ProfileSummary, SendMessageRequest},
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{MessageBackend, ProfileLookup, PushFrame, PushStream, PushTransport};

pub const CONVERSATION: ConversationId = ConversationId(7);

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    base_time() + chrono::Duration::seconds(offset_secs)
}

pub fn payload(id: i64, sender: i64, body: &str, sent_at: DateTime<Utc>) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: CONVERSATION,
        sender_id: UserId(sender),
        body: body.to_string(),
        sent_at,
        client_nonce: None,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub struct FakeBackend {
    messages: Mutex<Vec<MessagePayload>>,
    next_id: AtomicI64,
    pub list_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub fail_list: AtomicBool,
    pub fail_create: AtomicBool,
    echo_nonce: bool,
    write_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub requests: Mutex<Vec<SendMessageRequest>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// Backend that round-trips `client_nonce` onto the stored message.
    pub fn echoing_nonce() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(echo_nonce: bool) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            list_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            echo_nonce,
            write_gate: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn seed(&self, messages: Vec<MessagePayload>) {
        self.messages.lock().await.extend(messages);
    }

    pub async fn stored(&self) -> Vec<MessagePayload> {
        self.messages.lock().await.clone()
    }

    /// Holds the next write until the returned sender fires.
    pub async fn hold_next_write(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.write_gate.lock().await = Some(rx);
        tx
    }
}

#[async_trait]
impl MessageBackend for FakeBackend {
    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow!("backend unavailable"));
        }
        Ok(self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn create_message(&self, request: SendMessageRequest) -> Result<MessagePayload> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        let gate = self.write_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow!("write rejected: connection reset"));
        }

        let message = MessagePayload {
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            body: request.body,
            sent_at: Utc::now(),
            client_nonce: if self.echo_nonce {
                request.client_nonce
            } else {
                None
            },
        };
        self.messages.lock().await.push(message.clone());
        Ok(message)
    }
}

pub type FrameSender = mpsc::UnboundedSender<Result<PushFrame>>;

/// Push transport that hands out pre-registered connections in order and
/// fails once they run out.
#[derive(Default)]
pub struct FakePush {
    connections: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<PushFrame>>>>,
    pub subscribe_calls: AtomicUsize,
}

impl FakePush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn connection(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().await.push_back(rx);
        tx
    }
}

#[async_trait]
impl PushTransport for FakePush {
    async fn subscribe(&self, _conversation_id: ConversationId) -> Result<PushStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .connections
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("connection refused"))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[derive(Default)]
pub struct FakeProfiles {
    profiles: HashMap<UserId, ProfileSummary>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeProfiles {
    pub fn with(profiles: Vec<ProfileSummary>) -> Arc<Self> {
        Arc::new(Self {
            profiles: profiles.into_iter().map(|p| (p.user_id, p)).collect(),
            ..Self::default()
        })
    }
}

#[async_trait]
impl ProfileLookup for FakeProfiles {
    async fn lookup(&self, user_id: UserId) -> Result<Option<ProfileSummary>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("profile service unavailable"));
        }
        Ok(self.profiles.get(&user_id).cloned())
    }
}
