use serde::{Deserialize, Serialize};

use crate::domain::{
    ConversationId, MessageId, MessageKind, MessageStatus, Participant, PresenceStatus,
    SessionUser, UserId,
};

// Socket payloads. These are bincode-encoded inside the binary envelope, so
// every field is always serialized (no `skip_serializing_if`).

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub success: bool,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub to: UserId,
    pub kind: MessageKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPushPayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub from: UserId,
    pub to: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: MessageId,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub conversation_id: Option<ConversationId>,
    pub last_message_id: MessageId,
    pub last_sync_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub messages: Vec<ChatPushPayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePushPayload {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// Push-stream events (JSON).

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedEvent {
    #[serde(default)]
    pub server_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub timestamp: i64,
    /// Seconds until the server's next heartbeat, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    Connected(ConnectedEvent),
    Chat(ChatEvent),
    Heartbeat(HeartbeatEvent),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Chat(_) => "chat",
            Self::Heartbeat(_) => "heartbeat",
        }
    }
}

// REST request channel.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    pub created_at: i64,
}

impl From<ChatPushPayload> for MessageRecord {
    fn from(value: ChatPushPayload) -> Self {
        Self {
            id: value.message_id,
            conversation_id: value.conversation_id,
            sender_id: value.from,
            receiver_id: value.to,
            kind: value.kind,
            content: value.content,
            status: MessageStatus::Delivered,
            created_at: value.created_at,
        }
    }
}

impl From<ChatEvent> for MessageRecord {
    fn from(value: ChatEvent) -> Self {
        Self {
            id: value.message_id,
            conversation_id: value.conversation_id,
            sender_id: value.sender_id,
            receiver_id: value.receiver_id,
            kind: value.kind,
            content: value.content,
            status: MessageStatus::Delivered,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessagePreview {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub sender_id: UserId,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub participant: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePreview>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user: SessionUser,
    pub token: String,
}
