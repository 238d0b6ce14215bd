//! Optimistic apply and reconciliation of outgoing messages, plus the
//! idempotent inbound path shared by live pushes and sync pulls.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use shared::{
    domain::{ConversationId, LocalId, MessageKind, MessageStatus},
    protocol::MessageRecord,
};
use storage::{CachedMessage, LocalCache, MessageKey};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{api::MessageApi, auth::AuthProvider, error::ClientError, ClientEvent};

pub struct MessageCoordinator {
    cache: Arc<dyn LocalCache>,
    api: Arc<dyn MessageApi>,
    auth: Arc<dyn AuthProvider>,
    events: broadcast::Sender<ClientEvent>,
    next_local_id: AtomicI64,
}

impl MessageCoordinator {
    pub fn new(
        cache: Arc<dyn LocalCache>,
        api: Arc<dyn MessageApi>,
        auth: Arc<dyn AuthProvider>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        // Seeded from the clock so ids stay unique against failed records
        // persisted by earlier sessions.
        let seed = chrono::Utc::now().timestamp_millis();
        Self {
            cache,
            api,
            auth,
            events,
            next_local_id: AtomicI64::new(seed),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Writes a pending record, notifies observers, then submits it over the
    /// request channel.
    pub async fn submit(
        &self,
        conversation_id: ConversationId,
        content: &str,
        kind: MessageKind,
    ) -> Result<CachedMessage, ClientError> {
        let user = self
            .auth
            .current_user()
            .ok_or(ClientError::NotAuthenticated)?;
        let local_id = LocalId(self.next_local_id.fetch_add(1, Ordering::SeqCst));
        let receiver_id = match self.cache.conversation(conversation_id).await {
            Ok(conversation) => conversation.map(|conversation| conversation.participant.id),
            Err(err) => {
                warn!(%conversation_id, error = %err, "conversation lookup failed");
                None
            }
        };
        let pending = CachedMessage {
            key: MessageKey::Local(local_id),
            conversation_id,
            sender_id: user.id,
            receiver_id,
            kind,
            content: content.to_string(),
            status: MessageStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.cache
            .put_message(&pending)
            .await
            .map_err(ClientError::Cache)?;
        self.emit(ClientEvent::MessageReceived {
            message: pending.clone(),
        });
        self.deliver(local_id, pending).await
    }

    /// Resubmits a failed record under its original local id.
    pub async fn retry(&self, local_id: LocalId) -> Result<CachedMessage, ClientError> {
        if self.auth.current_user().is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        let failed = self
            .cache
            .get_message(MessageKey::Local(local_id))
            .await
            .map_err(ClientError::Cache)?
            .filter(|message| message.status == MessageStatus::Failed)
            .ok_or(ClientError::NotRetryable(local_id))?;
        let pending = CachedMessage {
            status: MessageStatus::Pending,
            ..failed
        };
        self.cache
            .put_message(&pending)
            .await
            .map_err(ClientError::Cache)?;
        self.emit(ClientEvent::MessageReceived {
            message: pending.clone(),
        });
        info!(%local_id, "retrying submission");
        self.deliver(local_id, pending).await
    }

    async fn deliver(
        &self,
        local_id: LocalId,
        pending: CachedMessage,
    ) -> Result<CachedMessage, ClientError> {
        match self
            .api
            .send_message(pending.conversation_id, pending.kind, &pending.content)
            .await
        {
            Ok(record) => {
                let confirmed = CachedMessage::from(record);
                self.reconcile(local_id, &pending, &confirmed).await;
                if let Some(id) = confirmed.server_id() {
                    if let Err(err) = self
                        .cache
                        .advance_sync_cursor(confirmed.conversation_id, id)
                        .await
                    {
                        warn!(%local_id, error = %err, "failed to advance sync cursor");
                    }
                }
                info!(%local_id, server_id = ?confirmed.server_id(), "submission confirmed");
                self.emit(ClientEvent::MessageDeleted { local_id });
                self.emit(ClientEvent::MessageReceived {
                    message: confirmed.clone(),
                });
                Ok(confirmed)
            }
            Err(source) => {
                warn!(%local_id, error = %source, "submission failed");
                let failed = CachedMessage {
                    status: MessageStatus::Failed,
                    ..pending
                };
                if let Err(err) = self.cache.put_message(&failed).await {
                    warn!(%local_id, error = %err, "failed to mark submission as failed");
                }
                self.emit(ClientEvent::MessageFailed {
                    local_id,
                    reason: source.to_string(),
                });
                Err(ClientError::SubmissionFailed { local_id, source })
            }
        }
    }

    /// Swaps the pending record for the confirmed one. The server has
    /// already accepted the message, so a failed swap falls back to a
    /// separate delete and put rather than failing the submission.
    async fn reconcile(
        &self,
        local_id: LocalId,
        pending: &CachedMessage,
        confirmed: &CachedMessage,
    ) {
        let Err(err) = self.cache.replace_message(pending.key, confirmed).await else {
            return;
        };
        warn!(%local_id, error = %err, "atomic replace failed; reconciling in two steps");
        if let Err(err) = self.cache.delete_message(pending.key).await {
            warn!(%local_id, error = %err, "failed to drop pending record");
        }
        if let Err(err) = self.cache.put_message(confirmed).await {
            warn!(%local_id, error = %err, "failed to store confirmed record");
        }
    }

    /// Applies one authoritative record. Re-applying the same record leaves
    /// the cache unchanged and emits nothing.
    pub async fn receive(&self, record: MessageRecord) -> Result<bool, ClientError> {
        let message = CachedMessage::from(record);
        let existing = self
            .cache
            .get_message(message.key)
            .await
            .map_err(ClientError::Cache)?;
        if existing.as_ref() == Some(&message) {
            return Ok(false);
        }
        self.cache
            .put_message(&message)
            .await
            .map_err(ClientError::Cache)?;
        if let Some(id) = message.server_id() {
            self.cache
                .advance_sync_cursor(message.conversation_id, id)
                .await
                .map_err(ClientError::Cache)?;
        }
        self.emit(ClientEvent::MessageReceived { message });
        Ok(true)
    }
}

#[cfg(test)]
#[path = "tests/outgoing_tests.rs"]
mod tests;
