use std::{sync::atomic::Ordering, time::Duration};

use shared::{domain::UserId, protocol::PushEvent};

use super::*;
use crate::{
    message::MessageStatus,
    test_support::{at, eventually, payload, FakeBackend, FakePush, CONVERSATION},
    transport::{PushFrame, StaticIdentity},
};

fn settings() -> SyncSettings {
    SyncSettings {
        poll_interval: Duration::from_secs(3600),
        reconnect_initial_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(20),
        ..SyncSettings::default()
    }
}

async fn open(backend: Arc<FakeBackend>, push: Arc<FakePush>) -> Arc<ConversationSession> {
    let deps = SessionDependencies {
        backend,
        push,
        identity: Arc::new(StaticIdentity(UserId(1))),
    };
    ConversationSession::open(&settings(), CONVERSATION, deps)
        .await
        .expect("open session")
}

async fn wait_for_len(session: &Arc<ConversationSession>, len: usize) -> bool {
    let session = Arc::clone(session);
    eventually(move || {
        let session = Arc::clone(&session);
        async move { session.snapshot().await.messages.len() == len }
    })
    .await
}

#[tokio::test]
async fn open_loads_history_with_an_immediate_poll() {
    let backend = FakeBackend::new();
    backend
        .seed(vec![payload(1, 2, "a", at(1)), payload(2, 3, "b", at(2))])
        .await;
    let session = open(backend, FakePush::new()).await;

    assert!(wait_for_len(&session, 2).await);
    assert_eq!(session.conversation_id(), CONVERSATION);
    session.close().await;
}

#[tokio::test]
async fn send_without_push_is_confirmed_by_on_demand_poll() {
    let backend = FakeBackend::new();
    let session = open(backend.clone(), FakePush::new()).await;
    let probe = Arc::clone(&backend);
    assert!(
        eventually(|| {
            let backend = Arc::clone(&probe);
            async move { backend.list_calls.load(Ordering::SeqCst) >= 1 }
        })
        .await
    );
    assert_ne!(session.push_state(), PushState::Subscribed);

    let token = session.send("offline-ish").await.expect("send");

    let store = Arc::clone(session.store());
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store.get(token).await.map(|m| m.status) == Some(MessageStatus::Confirmed)
            }
        })
        .await
    );
    assert_eq!(session.snapshot().await.messages.len(), 1);
    session.close().await;
}

#[tokio::test]
async fn push_insert_confirms_send_and_survives_repeat_poll() {
    let backend = FakeBackend::new();
    let push = FakePush::new();
    let conn = push.connection().await;
    let session = open(backend.clone(), push.clone()).await;

    conn.send(Ok(PushFrame::Opened)).expect("send frame");
    let mut state = session.watch_push_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == PushState::Subscribed),
    )
    .await
    .expect("subscribed in time")
    .expect("listener alive");

    let token = session.send("live").await.expect("send");
    let created = backend.stored().await.remove(0);
    let event = PushEvent::MessageInserted {
        message: created.clone(),
    };
    conn.send(Ok(PushFrame::Text(
        serde_json::to_string(&event).expect("json"),
    )))
    .expect("send frame");

    let store = Arc::clone(session.store());
    assert!(
        eventually(|| {
            let store = Arc::clone(&store);
            async move {
                store.get(token).await.map(|m| m.status) == Some(MessageStatus::Confirmed)
            }
        })
        .await
    );

    assert!(!session.store().merge_batch(vec![created]).await);
    assert_eq!(session.snapshot().await.messages.len(), 1);
    session.close().await;
}

#[tokio::test]
async fn events_report_push_state_changes() {
    let push = FakePush::new();
    let conn = push.connection().await;
    let session = open(FakeBackend::new(), push.clone()).await;
    let mut events = session.subscribe_events();

    conn.send(Ok(PushFrame::Opened)).expect("send frame");
    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::PushStateChanged(state)) => return state,
                Ok(_) => continue,
                Err(error) => panic!("event channel closed: {error}"),
            }
        }
    })
    .await
    .expect("event in time");
    assert_eq!(received, PushState::Subscribed);
    session.close().await;
}

#[tokio::test]
async fn close_stops_every_producer_and_rejects_sends() {
    let backend = FakeBackend::new();
    backend.seed(vec![payload(1, 2, "before", at(1))]).await;
    let push = FakePush::new();
    let conn = push.connection().await;
    let session = open(backend.clone(), push.clone()).await;
    assert!(wait_for_len(&session, 1).await);

    session.close().await;
    session.close().await;
    assert_eq!(session.push_state(), PushState::Disconnected);
    assert!(session.store().is_closed().await);

    let event = PushEvent::MessageInserted {
        message: payload(2, 2, "after", at(2)),
    };
    let _ = conn.send(Ok(PushFrame::Text(
        serde_json::to_string(&event).expect("json"),
    )));
    backend.seed(vec![payload(3, 2, "later", at(3))]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.snapshot().await.messages.len(), 1);
    assert!(matches!(
        session.send("too late").await,
        Err(SendError::SessionClosed)
    ));
    assert_eq!(backend.create_calls.load(Ordering::SeqCst), 0);
}
