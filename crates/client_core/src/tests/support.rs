use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{
        ConversationId, MessageId, MessageKind, MessageStatus, Participant, SessionUser, UserId,
    },
    error::ApiException,
    protocol::{
        ConversationRecord, LoginResponse, MessageRecord, MessagesResponse,
    },
};
use storage::{CachedConversation, CachedMessage, LocalCache, MemoryCache, MessageKey};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::{
    api::MessageApi, auth::SessionAuth, outgoing::MessageCoordinator, ClientEvent,
};

pub(crate) fn alice() -> SessionUser {
    SessionUser {
        id: UserId(1),
        username: "alice".into(),
        nickname: String::new(),
    }
}

pub(crate) fn record(id: i64, conversation: i64, content: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId(id),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(2),
        receiver_id: UserId(1),
        kind: MessageKind::Text,
        content: content.to_string(),
        status: MessageStatus::Delivered,
        created_at: 1_700_000_000 + id,
    }
}

/// Scriptable request channel.
#[derive(Default)]
pub(crate) struct FakeApi {
    pub fail_sends: AtomicBool,
    pub fail_pulls: AtomicBool,
    pub unauthorized_pulls: AtomicBool,
    pub send_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub sent: Mutex<Vec<(ConversationId, MessageKind, String)>>,
    pub pulls: Mutex<Vec<(ConversationId, Option<MessageId>)>>,
    pub server_log: Mutex<Vec<MessageRecord>>,
    next_id: AtomicI64,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1000),
            ..Self::default()
        })
    }

    pub async fn gate_sends(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock().await = Some(rx);
        tx
    }
}

#[async_trait]
impl MessageApi for FakeApi {
    async fn login(&self, username: &str, _password: &str) -> Result<LoginResponse> {
        Ok(LoginResponse {
            user: SessionUser {
                username: username.to_string(),
                ..alice()
            },
            token: "token-1".into(),
        })
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        Ok(Vec::new())
    }

    async fn conversation_with(&self, user_id: UserId) -> Result<ConversationRecord> {
        Ok(ConversationRecord {
            id: ConversationId(user_id.0 + 100),
            participant: Participant {
                id: user_id,
                username: format!("user{user_id}"),
                nickname: String::new(),
            },
            last_message: None,
            unread_count: 0,
            updated_at: 0,
        })
    }

    async fn fetch_messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagesResponse> {
        self.pulls.lock().await.push((conversation_id, after));
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        if self.unauthorized_pulls.load(Ordering::SeqCst) {
            return Err(ApiException::from_status(401, r#"{"error":"USER_INVALID_TOKEN"}"#).into());
        }
        let log = self.server_log.lock().await;
        let mut matching: Vec<MessageRecord> = log
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .filter(|message| after.map_or(true, |after| message.id > after))
            .cloned()
            .collect();
        matching.sort_by_key(|message| message.id);
        let has_more = matching.len() > limit as usize;
        matching.truncate(limit as usize);
        Ok(MessagesResponse {
            messages: matching,
            has_more,
        })
    }

    async fn fetch_messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagesResponse> {
        let log = self.server_log.lock().await;
        let mut matching: Vec<MessageRecord> = log
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .filter(|message| before.map_or(true, |before| message.id < before))
            .cloned()
            .collect();
        matching.sort_by_key(|message| std::cmp::Reverse(message.id));
        let has_more = matching.len() > limit as usize;
        matching.truncate(limit as usize);
        matching.reverse();
        Ok(MessagesResponse {
            messages: matching,
            has_more,
        })
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        content: &str,
    ) -> Result<MessageRecord> {
        let gate = self.send_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.sent
            .lock()
            .await
            .push((conversation_id, kind, content.to_string()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("connection reset by peer"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = MessageRecord {
            id: MessageId(id),
            conversation_id,
            sender_id: alice().id,
            receiver_id: UserId(2),
            kind,
            content: content.to_string(),
            status: MessageStatus::Sent,
            created_at: 1_700_000_000 + id,
        };
        self.server_log.lock().await.push(record.clone());
        Ok(record)
    }

    async fn mark_read(&self, _conversation_id: ConversationId) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct Harness {
    pub cache: Arc<MemoryCache>,
    pub api: Arc<FakeApi>,
    pub auth: Arc<SessionAuth>,
    pub events: broadcast::Receiver<ClientEvent>,
    pub messages: Arc<MessageCoordinator>,
}

pub(crate) fn harness() -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let api = FakeApi::new();
    let auth = Arc::new(SessionAuth::with_session(alice(), "token-1"));
    let (events_tx, events) = broadcast::channel(64);
    let messages = Arc::new(MessageCoordinator::new(
        cache.clone(),
        api.clone(),
        auth.clone(),
        events_tx,
    ));
    Harness {
        cache,
        api,
        auth,
        events,
        messages,
    }
}

/// Memory cache whose multi-key swap always fails.
#[derive(Default)]
pub(crate) struct ReplaceFailingCache {
    pub inner: MemoryCache,
}

#[async_trait]
impl LocalCache for ReplaceFailingCache {
    async fn put_message(&self, message: &CachedMessage) -> Result<()> {
        self.inner.put_message(message).await
    }

    async fn delete_message(&self, key: MessageKey) -> Result<()> {
        self.inner.delete_message(key).await
    }

    async fn replace_message(&self, _old: MessageKey, _new: &CachedMessage) -> Result<()> {
        Err(anyhow!("database is locked"))
    }

    async fn get_message(&self, key: MessageKey) -> Result<Option<CachedMessage>> {
        self.inner.get_message(key).await
    }

    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<CachedMessage>> {
        self.inner.messages_by_conversation(conversation_id).await
    }

    async fn last_message(&self) -> Result<Option<CachedMessage>> {
        self.inner.last_message().await
    }

    async fn put_conversation(&self, conversation: &CachedConversation) -> Result<()> {
        self.inner.put_conversation(conversation).await
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<CachedConversation>> {
        self.inner.conversation(id).await
    }

    async fn conversations(&self) -> Result<Vec<CachedConversation>> {
        self.inner.conversations().await
    }

    async fn sync_cursor(&self, conversation_id: ConversationId) -> Result<Option<MessageId>> {
        self.inner.sync_cursor(conversation_id).await
    }

    async fn advance_sync_cursor(
        &self,
        conversation_id: ConversationId,
        candidate: MessageId,
    ) -> Result<MessageId> {
        self.inner
            .advance_sync_cursor(conversation_id, candidate)
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}
