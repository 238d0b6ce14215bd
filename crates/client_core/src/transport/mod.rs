//! Transport seam shared by the socket and push-stream variants.
//!
//! A transport never calls back into the connection machine. Everything it
//! observes is posted as a [`LinkEvent`] on the channel it was built with,
//! tagged with the link generation it belongs to.

use async_trait::async_trait;
use shared::{domain::TransportKind, protocol::PushEvent};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    codec::{InboundFrame, OutboundFrame},
    connection::LinkId,
};

pub mod push_stream;
pub mod socket;

pub use push_stream::{PushStreamTransport, SseDecoder, SseFrame};
pub use socket::SocketTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Open(String),
    #[error("server rejected credential: {0}")]
    Unauthorized(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Closed,
    Failed(String),
    Frame(InboundFrame),
    Push(PushEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link: LinkId,
    pub event: TransportEvent,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRejection {
    NotConnected,
    NotAuthenticated,
    Unsupported,
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the wire. Socket frames report their sequence number.
    Sent { sequence: Option<u64> },
    Rejected(SendRejection),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Opens `link`, closing whatever link was open before. A link at or
    /// below the last `close` watermark is refused with `Closed`.
    async fn open(&self, link: LinkId, credential: &str) -> Result<(), TransportError>;

    /// Retires every link up to and including `through`, closing the open
    /// one if it falls in that range. An `open` still in flight for a
    /// retired link tears its connection down instead of keeping it.
    async fn close(&self, through: LinkId);

    async fn send(&self, frame: OutboundFrame) -> SendOutcome;

    /// Mirrors whether the connection machine is in its authenticated state.
    fn set_authenticated(&self, authenticated: bool);
}
