use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use shared::{domain::TransportKind, error::ApiException};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{codec::decode_named_event, codec::OutboundFrame, connection::LinkId};

use super::{
    LinkEvent, LinkEventSender, SendOutcome, SendRejection, Transport, TransportError,
    TransportEvent,
};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Accepts arbitrary chunk
/// boundaries, including ones that split a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let frame = SseFrame {
                event: self.event.take().unwrap_or_else(|| "message".into()),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(frame);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[derive(Default)]
struct StreamLink {
    link: Option<LinkId>,
    retired: LinkId,
    reader: Option<JoinHandle<()>>,
}

impl StreamLink {
    fn is_retired(&self, link: LinkId) -> bool {
        link <= self.retired
    }

    fn shutdown(&mut self) {
        self.link = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Server-push event stream. Commands travel over the request channel, so
/// the only frame this transport accepts is the liveness ping, which the
/// server asserts on its own.
pub struct PushStreamTransport {
    http: Client,
    server_url: String,
    events: LinkEventSender,
    authenticated: AtomicBool,
    link: Mutex<StreamLink>,
}

impl PushStreamTransport {
    pub fn new(http: Client, server_url: impl Into<String>, events: LinkEventSender) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            events,
            authenticated: AtomicBool::new(false),
            link: Mutex::new(StreamLink::default()),
        }
    }
}

#[async_trait]
impl Transport for PushStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PushStream
    }

    async fn open(&self, link: LinkId, credential: &str) -> Result<(), TransportError> {
        {
            let mut guard = self.link.lock().await;
            if guard.is_retired(link) {
                debug!(%link, "refusing to open a retired link");
                return Err(TransportError::Closed);
            }
            guard.shutdown();
            guard.link = Some(link);
        }

        let url = format!("{}/api/sse/subscribe", self.server_url);
        let response = self
            .http
            .get(&url)
            .query(&[("token", credential)])
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|err| TransportError::Open(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            let rejection = ApiException::from_status(status.as_u16(), &body);
            return Err(TransportError::Unauthorized(rejection.message));
        }
        if !status.is_success() {
            return Err(TransportError::Open(format!("{url} answered {status}")));
        }

        let mut guard = self.link.lock().await;
        if guard.link != Some(link) || guard.is_retired(link) {
            debug!(%link, "event stream opened for a superseded link");
            return Err(TransportError::Closed);
        }

        let events = self.events.clone();
        let mut body = response.bytes_stream();
        guard.reader = Some(tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let terminal = loop {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        for frame in decoder.push(&chunk) {
                            match decode_named_event(&frame.event, &frame.data) {
                                Ok(event) => {
                                    let _ = events.send(LinkEvent {
                                        link,
                                        event: TransportEvent::Push(event),
                                    });
                                }
                                Err(err) => {
                                    warn!(%link, event = %frame.event, error = %err, "dropping malformed event")
                                }
                            }
                        }
                    }
                    Some(Err(err)) => break TransportEvent::Failed(err.to_string()),
                    None => break TransportEvent::Closed,
                }
            };
            let _ = events.send(LinkEvent {
                link,
                event: terminal,
            });
        }));
        info!(%link, url = %url, "event stream open");
        Ok(())
    }

    async fn close(&self, through: LinkId) {
        self.authenticated.store(false, Ordering::SeqCst);
        let mut guard = self.link.lock().await;
        guard.retired = guard.retired.max(through);
        if guard.link.is_some_and(|open| open <= through) {
            guard.shutdown();
        }
    }

    async fn send(&self, frame: OutboundFrame) -> SendOutcome {
        match frame {
            OutboundFrame::Ping if !self.authenticated.load(Ordering::SeqCst) => {
                SendOutcome::Rejected(SendRejection::NotAuthenticated)
            }
            OutboundFrame::Ping => SendOutcome::Sent { sequence: None },
            other => {
                debug!(frame = other.name(), "push stream carries no outbound frames");
                SendOutcome::Rejected(SendRejection::Unsupported)
            }
        }
    }

    fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "../tests/push_stream_tests.rs"]
mod tests;
