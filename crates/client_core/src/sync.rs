//! Gap recovery: liveness-gap detection, poll throttling and cursor pulls.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use shared::domain::{ConversationId, MessageId};
use storage::LocalCache;
use tracing::{debug, info};

use crate::{api::MessageApi, error::ClientError, outgoing::MessageCoordinator};

/// Tracks the last confirmed server contact and reports when a newly
/// observed contact follows a window long enough to have missed pushes.
#[derive(Debug, Clone)]
pub struct GapDetector {
    threshold: Duration,
    last_contact: Option<Instant>,
}

impl GapDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_contact: None,
        }
    }

    pub fn last_contact(&self) -> Option<Instant> {
        self.last_contact
    }

    pub fn record_contact(&mut self, now: Instant) {
        self.last_contact = Some(now);
    }

    /// Records contact at `now` and returns whether the silence before it
    /// exceeded the threshold plus `slack`. With no prior contact the whole
    /// history is unknown, which counts as a gap.
    pub fn observe(&mut self, now: Instant, slack: Duration) -> bool {
        let gap = self
            .last_contact
            .map(|last| now.saturating_duration_since(last));
        self.last_contact = Some(now);
        match gap {
            None => true,
            Some(gap) => gap > self.threshold + slack,
        }
    }
}

/// Throttle for the constrained-device polling fallback.
#[derive(Debug, Clone)]
pub struct PollGate {
    min_interval: Duration,
    push_window: Duration,
    last_pull: Option<Instant>,
    last_push: Option<Instant>,
}

impl PollGate {
    pub fn new(min_interval: Duration, push_window: Duration) -> Self {
        Self {
            min_interval,
            push_window,
            last_pull: None,
            last_push: None,
        }
    }

    pub fn record_pull(&mut self, now: Instant) {
        self.last_pull = Some(now);
    }

    pub fn record_push(&mut self, now: Instant) {
        self.last_push = Some(now);
    }

    pub fn should_poll(&self, now: Instant, stream_connected: bool) -> bool {
        let within = |at: Option<Instant>, window: Duration| {
            at.is_some_and(|at| now.saturating_duration_since(at) < window)
        };
        if within(self.last_pull, self.min_interval) {
            return false;
        }
        !(stream_connected && within(self.last_push, self.push_window))
    }
}

/// Decides whether this client runs the polling fallback.
pub trait DeviceClassifier: Send + Sync {
    fn is_constrained(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDeviceClass(pub bool);

impl DeviceClassifier for FixedDeviceClass {
    fn is_constrained(&self) -> bool {
        self.0
    }
}

/// Treats well-known mobile user agents as constrained.
#[derive(Debug, Clone)]
pub struct UserAgentClassifier {
    user_agent: String,
}

impl UserAgentClassifier {
    const MOBILE_MARKERS: [&'static str; 9] = [
        "android",
        "webos",
        "iphone",
        "ipad",
        "ipod",
        "blackberry",
        "iemobile",
        "opera mini",
        "mobile",
    ];

    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl DeviceClassifier for UserAgentClassifier {
    fn is_constrained(&self) -> bool {
        let user_agent = self.user_agent.to_ascii_lowercase();
        Self::MOBILE_MARKERS
            .iter()
            .any(|marker| user_agent.contains(marker))
    }
}

impl<F> DeviceClassifier for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_constrained(&self) -> bool {
        self()
    }
}

pub struct SyncCoordinator {
    cache: Arc<dyn LocalCache>,
    api: Arc<dyn MessageApi>,
    messages: Arc<MessageCoordinator>,
    batch_size: u32,
}

impl SyncCoordinator {
    pub fn new(
        cache: Arc<dyn LocalCache>,
        api: Arc<dyn MessageApi>,
        messages: Arc<MessageCoordinator>,
        batch_size: u32,
    ) -> Self {
        Self {
            cache,
            api,
            messages,
            batch_size: batch_size.max(1),
        }
    }

    /// Highest server id durably applied for the conversation. Falls back to
    /// scanning cached messages when no cursor has been stored.
    pub async fn cursor(&self, conversation_id: ConversationId) -> Result<Option<MessageId>> {
        if let Some(cursor) = self.cache.sync_cursor(conversation_id).await? {
            return Ok(Some(cursor));
        }
        let scanned = self
            .cache
            .messages_by_conversation(conversation_id)
            .await?
            .iter()
            .filter_map(|message| message.server_id())
            .max();
        Ok(scanned)
    }

    /// Pulls everything above the cursor of the active conversation, one
    /// batch per request, applying each record through the inbound path.
    pub async fn pull(&self, active: Option<ConversationId>) -> Result<usize, ClientError> {
        let Some(conversation_id) = active else {
            debug!("no active conversation; skipping sync");
            return Ok(0);
        };

        let mut cursor = self
            .cursor(conversation_id)
            .await
            .map_err(ClientError::Cache)?;
        let mut applied = 0;
        loop {
            let page = self
                .api
                .fetch_messages_after(conversation_id, cursor, self.batch_size)
                .await
                .map_err(|source| ClientError::SyncPullFailed {
                    conversation_id,
                    source,
                })?;

            let before = cursor;
            for record in page.messages {
                if cursor.is_some_and(|cursor| record.id <= cursor) {
                    continue;
                }
                let id = record.id;
                if self.messages.receive(record).await? {
                    applied += 1;
                }
                cursor = Some(cursor.map_or(id, |cursor| cursor.max(id)));
            }

            if !page.has_more || cursor == before {
                break;
            }
        }

        info!(%conversation_id, applied, cursor = ?cursor.map(|id| id.0), "sync pull complete");
        Ok(applied)
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
