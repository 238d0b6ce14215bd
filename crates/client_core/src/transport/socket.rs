use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::domain::TransportKind;
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{
    codec::{decode_binary, encode_binary, InboundFrame, OutboundFrame, Sequenced},
    connection::LinkId,
};

use super::{
    LinkEvent, LinkEventSender, SendOutcome, SendRejection, Transport, TransportError,
    TransportEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct SocketLink {
    link: Option<LinkId>,
    retired: LinkId,
    writer: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
}

impl SocketLink {
    fn is_retired(&self, link: LinkId) -> bool {
        link <= self.retired
    }

    async fn shutdown(&mut self) {
        self.link = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }
    }
}

/// Websocket carrying bincode envelopes.
///
/// The sequence counter lives for the whole transport, so sequence numbers
/// keep increasing across reconnects.
pub struct SocketTransport {
    url: String,
    events: LinkEventSender,
    sequence: AtomicU64,
    authenticated: AtomicBool,
    link: Mutex<SocketLink>,
}

impl SocketTransport {
    pub fn new(url: impl Into<String>, events: LinkEventSender) -> Self {
        Self {
            url: url.into(),
            events,
            sequence: AtomicU64::new(0),
            authenticated: AtomicBool::new(false),
            link: Mutex::new(SocketLink::default()),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self, link: LinkId, _credential: &str) -> Result<(), TransportError> {
        {
            let mut guard = self.link.lock().await;
            if guard.is_retired(link) {
                debug!(%link, "refusing to open a retired link");
                return Err(TransportError::Closed);
            }
            guard.shutdown().await;
            guard.link = Some(link);
        }
        self.authenticated.store(false, Ordering::SeqCst);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Open(format!("{}: {err}", self.url)))?;
        let (mut writer, mut reader) = ws_stream.split();

        let mut guard = self.link.lock().await;
        if guard.link != Some(link) || guard.is_retired(link) {
            debug!(%link, "socket opened for a superseded link");
            let _ = writer.close().await;
            return Err(TransportError::Closed);
        }

        let events = self.events.clone();
        guard.reader = Some(tokio::spawn(async move {
            let terminal = loop {
                match reader.next().await {
                    Some(Ok(Message::Binary(bytes))) => {
                        match decode_binary::<InboundFrame>(&bytes) {
                            Ok(Sequenced { frame, .. }) => {
                                let _ = events.send(LinkEvent {
                                    link,
                                    event: TransportEvent::Frame(frame),
                                });
                            }
                            Err(err) => warn!(%link, error = %err, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break TransportEvent::Closed,
                    Some(Ok(Message::Text(_))) => {
                        warn!(%link, "dropping unexpected text frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break TransportEvent::Failed(err.to_string()),
                }
            };
            let _ = events.send(LinkEvent {
                link,
                event: terminal,
            });
        }));
        guard.writer = Some(writer);
        info!(%link, url = %self.url, "socket open");
        Ok(())
    }

    async fn close(&self, through: LinkId) {
        self.authenticated.store(false, Ordering::SeqCst);
        let mut guard = self.link.lock().await;
        guard.retired = guard.retired.max(through);
        if guard.link.is_some_and(|open| open <= through) {
            guard.shutdown().await;
        }
    }

    async fn send(&self, frame: OutboundFrame) -> SendOutcome {
        let is_auth = matches!(frame, OutboundFrame::Auth(_));
        if !is_auth && !self.authenticated.load(Ordering::SeqCst) {
            warn!(frame = frame.name(), "send while not authenticated; dropped");
            return SendOutcome::Rejected(SendRejection::NotAuthenticated);
        }

        let mut guard = self.link.lock().await;
        let Some(writer) = guard.writer.as_mut() else {
            warn!(frame = frame.name(), "send without an open socket; dropped");
            return SendOutcome::Rejected(SendRejection::NotConnected);
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = match encode_binary(&frame, sequence) {
            Ok(bytes) => bytes,
            Err(err) => return SendOutcome::Rejected(SendRejection::Io(err.to_string())),
        };
        match writer.send(Message::Binary(bytes)).await {
            Ok(()) => {
                debug!(frame = frame.name(), sequence, "frame sent");
                SendOutcome::Sent {
                    sequence: Some(sequence),
                }
            }
            Err(err) => {
                warn!(frame = frame.name(), error = %err, "socket write failed");
                SendOutcome::Rejected(SendRejection::Io(err.to_string()))
            }
        }
    }

    fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "../tests/socket_tests.rs"]
mod tests;
