use std::{collections::HashMap, convert::Infallible, time::Duration};

use super::*;
use axum::{
    extract::Query,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use futures::stream;
use shared::{
    domain::{MessageId, UserId},
    protocol::PushEvent,
};
use tokio::{net::TcpListener, sync::mpsc};

#[test]
fn decodes_named_events_across_chunks() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.push(b"event: conn").is_empty());
    assert!(decoder.push(b"ected\ndata: {\"user_id\":1}\n").is_empty());
    let frames = decoder.push(b"\n: keep-alive comment\n\nevent: heartbeat\r\ndata: {}\r\n\r\n");
    assert_eq!(
        frames,
        vec![
            SseFrame {
                event: "connected".into(),
                data: "{\"user_id\":1}".into(),
            },
            SseFrame {
                event: "heartbeat".into(),
                data: "{}".into(),
            },
        ]
    );
}

#[test]
fn joins_multi_line_data_and_defaults_event_name() {
    let mut decoder = SseDecoder::default();
    let frames = decoder.push(b"data: first\ndata: second\nid: 7\n\n");
    assert_eq!(
        frames,
        vec![SseFrame {
            event: "message".into(),
            data: "first\nsecond".into(),
        }]
    );
}

#[test]
fn keeps_utf8_split_across_chunks() {
    let mut decoder = SseDecoder::default();
    let bytes = "event: chat\ndata: {\"content\":\"héllo\"}\n\n".as_bytes();
    let split = bytes
        .iter()
        .position(|byte| *byte == 0xC3)
        .expect("multibyte char")
        + 1;
    assert!(decoder.push(&bytes[..split]).is_empty());
    let frames = decoder.push(&bytes[split..]);
    assert_eq!(frames[0].data, "{\"content\":\"héllo\"}");
}

async fn subscribe(Query(query): Query<HashMap<String, String>>) -> Response {
    if query.get("token").map(String::as_str) != Some("good-token") {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"error": "invalid token"})),
        )
            .into_response();
    }
    let events = stream::iter(vec![
        Ok::<_, Infallible>(
            Event::default()
                .event("connected")
                .data(r#"{"user_id":1,"conn_count":1}"#),
        ),
        Ok(Event::default().event("typing").data("{}")),
        Ok(Event::default().event("chat").data(
            r#"{"message_id":31,"conversation_id":4,"sender_id":2,"receiver_id":1,"type":"text","content":"hey","created_at":1700000000}"#,
        )),
    ])
    .chain(stream::pending());
    Sse::new(events).into_response()
}

async fn spawn_stream_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/api/sse/subscribe", get(subscribe));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn streams_events_and_drops_unknown_ones() {
    let server_url = spawn_stream_server().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = PushStreamTransport::new(Client::new(), server_url, tx);

    transport
        .open(LinkId(3), "good-token")
        .await
        .expect("open stream");

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("connected in time")
        .expect("connected");
    assert_eq!(first.link, LinkId(3));
    assert!(matches!(
        first.event,
        TransportEvent::Push(PushEvent::Connected(ref connected)) if connected.user_id == Some(UserId(1))
    ));

    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("chat in time")
        .expect("chat");
    match second.event {
        TransportEvent::Push(PushEvent::Chat(chat)) => {
            assert_eq!(chat.message_id, MessageId(31));
            assert_eq!(chat.content, "hey");
        }
        other => panic!("unexpected event {other:?}"),
    }

    transport.close(LinkId(3)).await;
}

#[tokio::test]
async fn rejected_token_is_reported_as_unauthorized() {
    let server_url = spawn_stream_server().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = PushStreamTransport::new(Client::new(), server_url, tx);

    let err = transport
        .open(LinkId(1), "stale-token")
        .await
        .expect_err("unauthorized");
    match err {
        TransportError::Unauthorized(reason) => assert_eq!(reason, "invalid token"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn only_ping_is_accepted_once_authenticated() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = PushStreamTransport::new(Client::new(), "http://127.0.0.1:9", tx);
    assert_eq!(
        transport.send(OutboundFrame::Ping).await,
        SendOutcome::Rejected(SendRejection::NotAuthenticated)
    );
    transport.set_authenticated(true);
    assert_eq!(
        transport.send(OutboundFrame::Ping).await,
        SendOutcome::Sent { sequence: None }
    );
    assert_eq!(
        transport
            .send(OutboundFrame::Presence(shared::protocol::PresencePayload {
                status: shared::domain::PresenceStatus::Away,
            }))
            .await,
        SendOutcome::Rejected(SendRejection::Unsupported)
    );
}

#[tokio::test]
async fn closed_links_cannot_be_reopened() {
    let server_url = spawn_stream_server().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = PushStreamTransport::new(Client::new(), server_url, tx);

    transport.close(LinkId(5)).await;
    for link in [LinkId(2), LinkId(5)] {
        assert!(matches!(
            transport.open(link, "good-token").await,
            Err(TransportError::Closed)
        ));
    }

    transport
        .open(LinkId(6), "good-token")
        .await
        .expect("newer link opens");
    transport.close(LinkId(4)).await;
    assert_eq!(transport.link.lock().await.link, Some(LinkId(6)));
    transport.close(LinkId(6)).await;
    assert_eq!(transport.link.lock().await.link, None);
}
