use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use shared::domain::{ConversationId, MessageId};

use crate::{CachedConversation, CachedMessage, LocalCache, MessageKey};

#[derive(Default)]
struct MemoryState {
    messages: HashMap<MessageKey, CachedMessage>,
    conversations: BTreeMap<ConversationId, CachedConversation>,
    cursors: HashMap<ConversationId, MessageId>,
}

/// Process-local cache used by tests and by clients that run without disk.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<MemoryState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn put_message(&self, message: &CachedMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        state.messages.insert(message.key, message.clone());
        Ok(())
    }

    async fn delete_message(&self, key: MessageKey) -> Result<()> {
        self.state.lock().await.messages.remove(&key);
        Ok(())
    }

    async fn replace_message(&self, old: MessageKey, new: &CachedMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        state.messages.remove(&old);
        state.messages.insert(new.key, new.clone());
        Ok(())
    }

    async fn get_message(&self, key: MessageKey) -> Result<Option<CachedMessage>> {
        Ok(self.state.lock().await.messages.get(&key).cloned())
    }

    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<CachedMessage>> {
        let state = self.state.lock().await;
        let mut messages: Vec<CachedMessage> = state
            .messages
            .values()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        // `MessageKey` orders every Server key before every Local key.
        messages.sort_by_key(|message| message.key);
        Ok(messages)
    }

    async fn last_message(&self) -> Result<Option<CachedMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|message| message.server_id().is_some())
            .max_by_key(|message| message.key)
            .cloned())
    }

    async fn put_conversation(&self, conversation: &CachedConversation) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<CachedConversation>> {
        Ok(self.state.lock().await.conversations.get(&id).cloned())
    }

    async fn conversations(&self) -> Result<Vec<CachedConversation>> {
        let state = self.state.lock().await;
        let mut conversations: Vec<CachedConversation> =
            state.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(conversations)
    }

    async fn sync_cursor(&self, conversation_id: ConversationId) -> Result<Option<MessageId>> {
        Ok(self
            .state
            .lock()
            .await
            .cursors
            .get(&conversation_id)
            .copied())
    }

    async fn advance_sync_cursor(
        &self,
        conversation_id: ConversationId,
        candidate: MessageId,
    ) -> Result<MessageId> {
        let mut state = self.state.lock().await;
        let cursor = state.cursors.entry(conversation_id).or_insert(candidate);
        if candidate > *cursor {
            *cursor = candidate;
        }
        Ok(*cursor)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = MemoryState::default();
        Ok(())
    }
}
