use super::*;
use crate::{
    auth::SessionAuth,
    test_support::{alice, harness, record, FakeApi, ReplaceFailingCache},
};
use shared::domain::MessageId;
use std::time::Duration;

#[tokio::test]
async fn pending_record_is_visible_before_network_completes() {
    let harness = harness();
    let release = harness.api.gate_sends().await;

    let messages = harness.messages.clone();
    let submission =
        tokio::spawn(async move { messages.submit(ConversationId(1), "hi", MessageKind::Text).await });

    let mut events = harness.events;
    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("optimistic notification")
        .expect("event");
    let local_id = match first {
        ClientEvent::MessageReceived { message } => {
            assert_eq!(message.status, MessageStatus::Pending);
            assert_eq!(message.content, "hi");
            message.local_id().expect("local key")
        }
        other => panic!("unexpected event {other:?}"),
    };

    let cached = harness
        .cache
        .messages_by_conversation(ConversationId(1))
        .await
        .expect("list");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].status, MessageStatus::Pending);
    assert!(harness.api.sent.lock().await.is_empty());

    release.send(()).expect("release");
    let confirmed = submission.await.expect("join").expect("submit");

    assert!(matches!(
        events.recv().await.expect("deleted"),
        ClientEvent::MessageDeleted { local_id: deleted } if deleted == local_id
    ));
    assert!(matches!(
        events.recv().await.expect("received"),
        ClientEvent::MessageReceived { message } if message.server_id() == confirmed.server_id()
    ));

    let cached = harness
        .cache
        .messages_by_conversation(ConversationId(1))
        .await
        .expect("list");
    assert_eq!(cached, vec![confirmed.clone()]);
    assert_eq!(
        harness
            .cache
            .sync_cursor(ConversationId(1))
            .await
            .expect("cursor"),
        confirmed.server_id()
    );
}

#[tokio::test]
async fn failed_submission_leaves_exactly_one_failed_record() {
    let mut harness = harness();
    harness.api.fail_sends.store(true, Ordering::SeqCst);

    let err = harness
        .messages
        .submit(ConversationId(2), "lost", MessageKind::Text)
        .await
        .expect_err("network failure");
    let local_id = match err {
        ClientError::SubmissionFailed { local_id, .. } => local_id,
        other => panic!("unexpected error {other:?}"),
    };

    let cached = harness
        .cache
        .messages_by_conversation(ConversationId(2))
        .await
        .expect("list");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].key, MessageKey::Local(local_id));
    assert_eq!(cached[0].status, MessageStatus::Failed);

    assert!(matches!(
        harness.events.recv().await.expect("pending"),
        ClientEvent::MessageReceived { .. }
    ));
    assert!(matches!(
        harness.events.recv().await.expect("failed"),
        ClientEvent::MessageFailed { local_id: failed, .. } if failed == local_id
    ));
    // No automatic retry.
    assert_eq!(harness.api.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn retry_resubmits_under_the_same_local_id() {
    let harness = harness();
    harness.api.fail_sends.store(true, Ordering::SeqCst);
    let Err(ClientError::SubmissionFailed { local_id, .. }) = harness
        .messages
        .submit(ConversationId(2), "again", MessageKind::Text)
        .await
    else {
        panic!("expected failure");
    };

    harness.api.fail_sends.store(false, Ordering::SeqCst);
    let confirmed = harness.messages.retry(local_id).await.expect("retry");
    assert_eq!(confirmed.content, "again");

    let cached = harness
        .cache
        .messages_by_conversation(ConversationId(2))
        .await
        .expect("list");
    assert_eq!(cached, vec![confirmed]);

    assert!(matches!(
        harness.messages.retry(local_id).await,
        Err(ClientError::NotRetryable(_))
    ));
}

#[tokio::test]
async fn submit_requires_a_session() {
    let harness = harness();
    harness.auth.clear();
    assert!(matches!(
        harness
            .messages
            .submit(ConversationId(1), "hi", MessageKind::Text)
            .await,
        Err(ClientError::NotAuthenticated)
    ));
    assert!(harness
        .cache
        .messages_by_conversation(ConversationId(1))
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn receiving_the_same_record_twice_is_idempotent() {
    let mut harness = harness();
    assert!(harness
        .messages
        .receive(record(7, 3, "hello"))
        .await
        .expect("first"));
    let after_first = harness
        .cache
        .messages_by_conversation(ConversationId(3))
        .await
        .expect("list");

    assert!(!harness
        .messages
        .receive(record(7, 3, "hello"))
        .await
        .expect("second"));
    let after_second = harness
        .cache
        .messages_by_conversation(ConversationId(3))
        .await
        .expect("list");

    assert_eq!(after_first, after_second);
    assert_eq!(after_second.len(), 1);
    assert!(matches!(
        harness.events.try_recv(),
        Ok(ClientEvent::MessageReceived { .. })
    ));
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test]
async fn push_echo_before_reply_does_not_duplicate() {
    let harness = harness();
    let release = harness.api.gate_sends().await;
    let messages = harness.messages.clone();
    let submission = tokio::spawn(async move {
        messages
            .submit(ConversationId(5), "echo", MessageKind::Text)
            .await
    });

    // The server pushes the confirmed record to the sender before the HTTP
    // reply arrives.
    tokio::task::yield_now().await;
    let mut echoed = record(1000, 5, "echo");
    echoed.sender_id = shared::domain::UserId(1);
    echoed.receiver_id = shared::domain::UserId(2);
    echoed.status = MessageStatus::Sent;
    harness.messages.receive(echoed).await.expect("echo");

    release.send(()).expect("release");
    submission.await.expect("join").expect("submit");

    let cached = harness
        .cache
        .messages_by_conversation(ConversationId(5))
        .await
        .expect("list");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].server_id(), Some(shared::domain::MessageId(1000)));
}

#[tokio::test]
async fn confirmed_submission_survives_a_failed_cache_swap() {
    let cache = Arc::new(ReplaceFailingCache::default());
    let api = FakeApi::new();
    let (events_tx, mut events) = broadcast::channel(16);
    let messages = MessageCoordinator::new(
        cache.clone(),
        api.clone(),
        Arc::new(SessionAuth::with_session(alice(), "token-1")),
        events_tx,
    );

    let confirmed = messages
        .submit(ConversationId(5), "still here", MessageKind::Text)
        .await
        .expect("server accepted");

    let cached = cache
        .messages_by_conversation(ConversationId(5))
        .await
        .expect("list");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].server_id(), Some(MessageId(1000)));
    assert_eq!(cached[0], confirmed);
    assert_eq!(
        cache.sync_cursor(ConversationId(5)).await.expect("cursor"),
        Some(MessageId(1000))
    );

    let pending_id = match events.recv().await.expect("pending") {
        ClientEvent::MessageReceived { message } => message.local_id().expect("local key"),
        other => panic!("unexpected event {other:?}"),
    };
    assert!(matches!(
        events.recv().await.expect("deleted"),
        ClientEvent::MessageDeleted { local_id } if local_id == pending_id
    ));
}
