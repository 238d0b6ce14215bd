use crate::{
    domain::{ConversationId, MessageId, MessageKind, MessageStatus, TransportKind, UserId},
    error::{ApiException, ErrorCode},
    protocol::{ChatEvent, ConversationRecord, MessageRecord, MessagesResponse, PushEvent},
};

#[test]
fn message_record_uses_server_field_names() {
    let raw = r#"{
        "id": 42,
        "conversation_id": 7,
        "sender_id": 1,
        "receiver_id": 2,
        "type": "image",
        "content": "media-9",
        "status": "read",
        "created_at": 1700000000
    }"#;
    let record: MessageRecord = serde_json::from_str(raw).expect("record");
    assert_eq!(record.id, MessageId(42));
    assert_eq!(record.conversation_id, ConversationId(7));
    assert_eq!(record.kind, MessageKind::Image);
    assert_eq!(record.status, MessageStatus::Read);
}

#[test]
fn messages_response_defaults_has_more() {
    let parsed: MessagesResponse = serde_json::from_str(r#"{"messages": []}"#).expect("parse");
    assert!(parsed.messages.is_empty());
    assert!(!parsed.has_more);
}

#[test]
fn conversation_record_tolerates_missing_optional_fields() {
    let raw = r#"{"id": 3, "participant": {"id": 9, "username": "bob"}}"#;
    let record: ConversationRecord = serde_json::from_str(raw).expect("conversation");
    assert_eq!(record.participant.id, UserId(9));
    assert_eq!(record.unread_count, 0);
    assert!(record.last_message.is_none());
}

#[test]
fn chat_event_converts_to_delivered_record() {
    let event = ChatEvent {
        message_id: MessageId(5),
        conversation_id: ConversationId(1),
        sender_id: UserId(2),
        receiver_id: UserId(3),
        kind: MessageKind::Text,
        content: "hi".into(),
        created_at: 10,
    };
    let record = MessageRecord::from(event);
    assert_eq!(record.status, MessageStatus::Delivered);
    assert_eq!(record.sender_id, UserId(2));
}

#[test]
fn push_event_serializes_with_type_and_payload() {
    let event = PushEvent::Heartbeat(crate::protocol::HeartbeatEvent {
        timestamp: 99,
        interval: None,
    });
    let json = serde_json::to_value(&event).expect("json");
    assert_eq!(json["type"], "heartbeat");
    assert_eq!(json["payload"]["timestamp"], 99);
    assert_eq!(event.name(), "heartbeat");
}

#[test]
fn parses_transport_kind_aliases() {
    assert_eq!(TransportKind::parse("sse"), Some(TransportKind::PushStream));
    assert_eq!(TransportKind::parse("push-stream"), Some(TransportKind::PushStream));
    assert_eq!(TransportKind::parse("WebSocket"), Some(TransportKind::Socket));
    assert_eq!(TransportKind::parse("carrier-pigeon"), None);
}

#[test]
fn api_exception_reads_error_body() {
    let err = ApiException::from_status(401, r#"{"error":"USER_INVALID_TOKEN"}"#);
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert_eq!(err.message, "USER_INVALID_TOKEN");
    assert!(err.is_unauthorized());

    let err = ApiException::from_status(500, "boom\n");
    assert_eq!(err.code, ErrorCode::Internal);
    assert_eq!(err.message, "boom");
}
