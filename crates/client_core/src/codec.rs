//! Wire encodings for both transports.
//!
//! The socket transport carries a bincode [`Envelope`] whose payload is itself
//! an independently bincode-encoded message. The push stream carries JSON
//! objects of the form `{"type": <event name>, "payload": {...}}`, or named
//! server-sent events whose `data:` line is the bare payload.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::protocol::{
    AckPayload, AuthPayload, AuthResponsePayload, ChatPayload, ChatPushPayload, ConnectedEvent,
    ErrorPayload, HeartbeatEvent, PresencePayload, PresencePushPayload, PushEvent,
    SyncRequestPayload, SyncResponsePayload,
};
use thiserror::Error;

/// Largest binary frame accepted from or written to the wire: 256 KB.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEnvelope {
    #[error("envelope truncated")]
    Truncated,
    #[error("envelope of {0} bytes exceeds the frame limit")]
    Oversized(usize),
    #[error("unknown envelope tag {0}")]
    UnknownTag(u16),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameTag {
    Auth = 1,
    Chat = 2,
    Ack = 3,
    SyncRequest = 4,
    Presence = 5,
    Ping = 6,
    AuthResponse = 101,
    ChatPush = 102,
    SyncResponse = 103,
    PresencePush = 104,
    Pong = 105,
    Error = 106,
}

impl FrameTag {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::Auth,
            2 => Self::Chat,
            3 => Self::Ack,
            4 => Self::SyncRequest,
            5 => Self::Presence,
            6 => Self::Ping,
            101 => Self::AuthResponse,
            102 => Self::ChatPush,
            103 => Self::SyncResponse,
            104 => Self::PresencePush,
            105 => Self::Pong,
            106 => Self::Error,
            _ => return None,
        })
    }
}

/// Outer binary frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: u16,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Auth(AuthPayload),
    Chat(ChatPayload),
    Ack(AckPayload),
    SyncRequest(SyncRequestPayload),
    Presence(PresencePayload),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    AuthResponse(AuthResponsePayload),
    ChatPush(ChatPushPayload),
    SyncResponse(SyncResponsePayload),
    PresencePush(PresencePushPayload),
    Pong,
    Error(ErrorPayload),
}

/// A frame that knows its envelope tag and how to (de)serialize its payload.
pub trait WireFrame: Sized {
    fn tag(&self) -> FrameTag;
    fn encode_payload(&self) -> Result<Vec<u8>, MalformedEnvelope>;
    fn decode_payload(tag: FrameTag, payload: &[u8]) -> Result<Self, MalformedEnvelope>;
}

impl OutboundFrame {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Chat(_) => "chat",
            Self::Ack(_) => "ack",
            Self::SyncRequest(_) => "sync_request",
            Self::Presence(_) => "presence",
            Self::Ping => "ping",
        }
    }
}

impl WireFrame for OutboundFrame {
    fn tag(&self) -> FrameTag {
        match self {
            Self::Auth(_) => FrameTag::Auth,
            Self::Chat(_) => FrameTag::Chat,
            Self::Ack(_) => FrameTag::Ack,
            Self::SyncRequest(_) => FrameTag::SyncRequest,
            Self::Presence(_) => FrameTag::Presence,
            Self::Ping => FrameTag::Ping,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, MalformedEnvelope> {
        match self {
            Self::Auth(payload) => to_bytes(payload),
            Self::Chat(payload) => to_bytes(payload),
            Self::Ack(payload) => to_bytes(payload),
            Self::SyncRequest(payload) => to_bytes(payload),
            Self::Presence(payload) => to_bytes(payload),
            Self::Ping => Ok(Vec::new()),
        }
    }

    fn decode_payload(tag: FrameTag, payload: &[u8]) -> Result<Self, MalformedEnvelope> {
        Ok(match tag {
            FrameTag::Auth => Self::Auth(from_bytes(payload)?),
            FrameTag::Chat => Self::Chat(from_bytes(payload)?),
            FrameTag::Ack => Self::Ack(from_bytes(payload)?),
            FrameTag::SyncRequest => Self::SyncRequest(from_bytes(payload)?),
            FrameTag::Presence => Self::Presence(from_bytes(payload)?),
            FrameTag::Ping => Self::Ping,
            other => return Err(MalformedEnvelope::UnknownTag(other as u16)),
        })
    }
}

impl WireFrame for InboundFrame {
    fn tag(&self) -> FrameTag {
        match self {
            Self::AuthResponse(_) => FrameTag::AuthResponse,
            Self::ChatPush(_) => FrameTag::ChatPush,
            Self::SyncResponse(_) => FrameTag::SyncResponse,
            Self::PresencePush(_) => FrameTag::PresencePush,
            Self::Pong => FrameTag::Pong,
            Self::Error(_) => FrameTag::Error,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, MalformedEnvelope> {
        match self {
            Self::AuthResponse(payload) => to_bytes(payload),
            Self::ChatPush(payload) => to_bytes(payload),
            Self::SyncResponse(payload) => to_bytes(payload),
            Self::PresencePush(payload) => to_bytes(payload),
            Self::Pong => Ok(Vec::new()),
            Self::Error(payload) => to_bytes(payload),
        }
    }

    fn decode_payload(tag: FrameTag, payload: &[u8]) -> Result<Self, MalformedEnvelope> {
        Ok(match tag {
            FrameTag::AuthResponse => Self::AuthResponse(from_bytes(payload)?),
            FrameTag::ChatPush => Self::ChatPush(from_bytes(payload)?),
            FrameTag::SyncResponse => Self::SyncResponse(from_bytes(payload)?),
            FrameTag::PresencePush => Self::PresencePush(from_bytes(payload)?),
            FrameTag::Pong => Self::Pong,
            FrameTag::Error => Self::Error(from_bytes(payload)?),
            other => return Err(MalformedEnvelope::UnknownTag(other as u16)),
        })
    }
}

/// A decoded frame together with the sequence number it travelled under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced<F> {
    pub sequence: u64,
    pub frame: F,
}

pub fn encode_binary<F: WireFrame>(frame: &F, sequence: u64) -> Result<Vec<u8>, MalformedEnvelope> {
    let envelope = Envelope {
        kind: frame.tag() as u16,
        sequence,
        payload: frame.encode_payload()?,
    };
    let bytes = to_bytes(&envelope)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(MalformedEnvelope::Oversized(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode_binary<F: WireFrame>(bytes: &[u8]) -> Result<Sequenced<F>, MalformedEnvelope> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(MalformedEnvelope::Oversized(bytes.len()));
    }
    let envelope: Envelope = from_bytes(bytes)?;
    let tag = FrameTag::from_u16(envelope.kind)
        .ok_or(MalformedEnvelope::UnknownTag(envelope.kind))?;
    Ok(Sequenced {
        sequence: envelope.sequence,
        frame: F::decode_payload(tag, &envelope.payload)?,
    })
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, MalformedEnvelope> {
    bincode::serialize(value).map_err(|err| MalformedEnvelope::InvalidPayload(err.to_string()))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MalformedEnvelope> {
    bincode::deserialize(bytes).map_err(|err| match err.as_ref() {
        bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            MalformedEnvelope::Truncated
        }
        _ => MalformedEnvelope::InvalidPayload(err.to_string()),
    })
}

pub fn encode_text(event: &PushEvent) -> Result<String, MalformedEnvelope> {
    serde_json::to_string(event).map_err(|err| MalformedEnvelope::InvalidPayload(err.to_string()))
}

pub fn decode_text(raw: &str) -> Result<PushEvent, MalformedEnvelope> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(json_error)?;
    let name = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| MalformedEnvelope::InvalidPayload("missing event type".into()))?;
    let payload = value
        .get("payload")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    decode_event_value(name, payload)
}

/// Decodes one server-sent event given its `event:` name and `data:` body.
pub fn decode_named_event(name: &str, data: &str) -> Result<PushEvent, MalformedEnvelope> {
    let payload = if data.trim().is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_str(data).map_err(json_error)?
    };
    decode_event_value(name, payload)
}

fn decode_event_value(name: &str, payload: serde_json::Value) -> Result<PushEvent, MalformedEnvelope> {
    let invalid = |err: serde_json::Error| MalformedEnvelope::InvalidPayload(err.to_string());
    Ok(match name {
        "connected" => PushEvent::Connected(
            serde_json::from_value::<ConnectedEvent>(payload).map_err(invalid)?,
        ),
        "chat" => PushEvent::Chat(serde_json::from_value(payload).map_err(invalid)?),
        "heartbeat" => PushEvent::Heartbeat(
            serde_json::from_value::<HeartbeatEvent>(payload).map_err(invalid)?,
        ),
        other => return Err(MalformedEnvelope::UnknownEvent(other.to_string())),
    })
}

fn json_error(err: serde_json::Error) -> MalformedEnvelope {
    if err.is_eof() {
        MalformedEnvelope::Truncated
    } else {
        MalformedEnvelope::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
