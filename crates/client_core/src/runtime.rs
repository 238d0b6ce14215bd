//! The driver task that owns the connection machine.
//!
//! Commands from the facade, link events from the transport, open outcomes
//! and timer firings are all consumed by one `select!` loop, so the machine
//! sees a single ordered stream of inputs.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    domain::{ConversationId, MessageStatus, PresenceStatus},
    protocol::{AckPayload, AuthPayload, MessageRecord, PresencePayload, PushEvent},
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthProvider,
    codec::{InboundFrame, OutboundFrame},
    connection::{ConnectionAction, ConnectionInput, ConnectionMachine, ConnectionState, LinkId},
    outgoing::MessageCoordinator,
    scheduler::TimerHandle,
    sync::{GapDetector, PollGate, SyncCoordinator},
    transport::{LinkEvent, SendOutcome, Transport, TransportError, TransportEvent},
    ClientEvent,
};

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    SyncNow,
    SetPresence {
        status: PresenceStatus,
        reply: oneshot::Sender<SendOutcome>,
    },
    Shutdown,
}

struct OpenOutcome {
    link: LinkId,
    result: Result<(), TransportError>,
}

pub(crate) struct DriverChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub link_events: mpsc::UnboundedReceiver<LinkEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerHandle>,
    pub state: watch::Sender<ConnectionState>,
    pub active: watch::Receiver<Option<ConversationId>>,
}

pub(crate) struct Driver {
    machine: ConnectionMachine,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    messages: Arc<MessageCoordinator>,
    sync: Arc<SyncCoordinator>,
    events: broadcast::Sender<ClientEvent>,
    gap: GapDetector,
    poll_gate: PollGate,
    stream_connected: bool,
    channels: DriverChannels,
    opened_tx: mpsc::UnboundedSender<OpenOutcome>,
    opened_rx: mpsc::UnboundedReceiver<OpenOutcome>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        machine: ConnectionMachine,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        messages: Arc<MessageCoordinator>,
        sync: Arc<SyncCoordinator>,
        events: broadcast::Sender<ClientEvent>,
        gap: GapDetector,
        poll_gate: PollGate,
        channels: DriverChannels,
    ) -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            machine,
            transport,
            auth,
            messages,
            sync,
            events,
            gap,
            poll_gate,
            stream_connected: false,
            channels,
            opened_tx,
            opened_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.channels.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.process(ConnectionInput::Disconnect).await;
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = self.channels.link_events.recv() => self.on_link_event(event).await,
                Some(outcome) = self.opened_rx.recv() => self.on_open_outcome(outcome).await,
                Some(timer) = self.channels.timers.recv() => {
                    self.process(ConnectionInput::TimerFired(timer)).await;
                }
            }
        }
        info!("client driver stopped");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.process(ConnectionInput::Connect).await,
            Command::Disconnect => self.process(ConnectionInput::Disconnect).await,
            Command::SyncNow => self.spawn_sync("requested"),
            Command::SetPresence { status, reply } => {
                let outcome = self
                    .transport
                    .send(OutboundFrame::Presence(PresencePayload { status }))
                    .await;
                let _ = reply.send(outcome);
            }
            Command::Shutdown => {}
        }
    }

    /// Feeds `input` to the machine and executes the resulting actions,
    /// including any inputs those actions produce.
    async fn process(&mut self, input: ConnectionInput) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            let actions = self.machine.handle(input);
            self.transport
                .set_authenticated(self.machine.is_authenticated());
            self.channels.state.send_replace(self.machine.state());
            for action in actions {
                if let Some(next) = self.perform(action).await {
                    pending.push_back(next);
                }
            }
        }
    }

    async fn perform(&mut self, action: ConnectionAction) -> Option<ConnectionInput> {
        match action {
            ConnectionAction::OpenTransport { link } => {
                let Some(token) = self.auth.token() else {
                    return Some(ConnectionInput::TransportFailed {
                        link,
                        reason: "no credential available".into(),
                    });
                };
                let transport = self.transport.clone();
                let opened = self.opened_tx.clone();
                tokio::spawn(async move {
                    let result = transport.open(link, &token).await;
                    let _ = opened.send(OpenOutcome { link, result });
                });
                None
            }
            ConnectionAction::CloseTransport => {
                self.stream_connected = false;
                self.transport.close(self.machine.link()).await;
                None
            }
            ConnectionAction::SendAuth => {
                let link = self.machine.link();
                let Some(token) = self.auth.token() else {
                    return Some(ConnectionInput::AuthRejected {
                        link,
                        reason: "no credential available".into(),
                    });
                };
                match self
                    .transport
                    .send(OutboundFrame::Auth(AuthPayload { token }))
                    .await
                {
                    SendOutcome::Sent { .. } => None,
                    SendOutcome::Rejected(rejection) => Some(ConnectionInput::TransportFailed {
                        link,
                        reason: format!("auth frame rejected: {rejection:?}"),
                    }),
                }
            }
            ConnectionAction::SendHeartbeat => {
                let outcome = self.transport.send(OutboundFrame::Ping).await;
                if !outcome.is_sent() {
                    debug!(?outcome, "heartbeat not sent");
                }
                None
            }
            ConnectionAction::StartSync => {
                self.spawn_sync("authenticated");
                None
            }
            ConnectionAction::Poll => {
                if self.poll_gate.should_poll(Instant::now(), self.stream_connected) {
                    self.spawn_sync("poll");
                } else {
                    debug!(stream_connected = self.stream_connected, "poll throttled");
                }
                None
            }
            ConnectionAction::NotifyConnectivity(connected) => {
                self.emit(ClientEvent::ConnectivityChanged { connected });
                None
            }
            ConnectionAction::SurfaceAuthRejected(reason) => {
                self.emit(ClientEvent::AuthenticationRejected { reason });
                None
            }
        }
    }

    async fn on_open_outcome(&mut self, OpenOutcome { link, result }: OpenOutcome) {
        if result.is_ok() && link != self.machine.link() {
            debug!(
                %link,
                current = %self.machine.link(),
                "closing link opened after it was superseded"
            );
            self.transport.close(link).await;
            return;
        }
        let input = match result {
            Ok(()) => ConnectionInput::TransportOpened { link },
            Err(TransportError::Unauthorized(reason)) => {
                ConnectionInput::AuthRejected { link, reason }
            }
            Err(err) => ConnectionInput::TransportFailed {
                link,
                reason: err.to_string(),
            },
        };
        self.process(input).await;
    }

    async fn on_link_event(&mut self, LinkEvent { link, event }: LinkEvent) {
        if link != self.machine.link() {
            debug!(%link, current = %self.machine.link(), "dropping event from stale link");
            return;
        }
        match event {
            TransportEvent::Closed => self.process(ConnectionInput::TransportClosed { link }).await,
            TransportEvent::Failed(reason) => {
                self.process(ConnectionInput::TransportFailed { link, reason })
                    .await
            }
            TransportEvent::Frame(frame) => {
                self.gap.record_contact(Instant::now());
                self.on_frame(link, frame).await;
            }
            TransportEvent::Push(event) => self.on_push(event).await,
        }
    }

    async fn on_frame(&mut self, link: LinkId, frame: InboundFrame) {
        match frame {
            InboundFrame::AuthResponse(response) => {
                let input = if response.success {
                    ConnectionInput::AuthAccepted { link }
                } else {
                    ConnectionInput::AuthRejected {
                        link,
                        reason: response
                            .error
                            .unwrap_or_else(|| "authentication failed".into()),
                    }
                };
                self.process(input).await;
            }
            InboundFrame::ChatPush(push) => {
                let message_id = push.message_id;
                match self.messages.receive(MessageRecord::from(push)).await {
                    Ok(_) => {
                        let ack = OutboundFrame::Ack(AckPayload {
                            message_id,
                            status: MessageStatus::Delivered,
                        });
                        let outcome = self.transport.send(ack).await;
                        if !outcome.is_sent() {
                            debug!(%message_id, ?outcome, "delivery ack not sent");
                        }
                    }
                    Err(err) => warn!(%message_id, error = %err, "failed to apply pushed message"),
                }
            }
            InboundFrame::SyncResponse(response) => {
                for push in response.messages {
                    if let Err(err) = self.messages.receive(MessageRecord::from(push)).await {
                        warn!(error = %err, "failed to apply synced message");
                    }
                }
            }
            InboundFrame::PresencePush(presence) => {
                self.emit(ClientEvent::PresenceChanged {
                    user_id: presence.user_id,
                    status: presence.status,
                });
            }
            InboundFrame::Pong => debug!(%link, "pong"),
            InboundFrame::Error(error) => {
                warn!(%link, code = %error.code, message = %error.message, "server error frame");
                self.emit(ClientEvent::Error(format!("{}: {}", error.code, error.message)));
            }
        }
    }

    async fn on_push(&mut self, event: PushEvent) {
        let now = Instant::now();
        match event {
            PushEvent::Connected(connected) => {
                self.stream_connected = true;
                if self.gap.observe(now, Duration::ZERO) {
                    info!(server_time = connected.server_time, "stream connected after gap");
                    self.spawn_sync("gap");
                }
            }
            PushEvent::Heartbeat(heartbeat) => {
                let slack = Duration::from_secs(heartbeat.interval.unwrap_or(0));
                if self.gap.observe(now, slack) {
                    info!(timestamp = heartbeat.timestamp, "heartbeat after gap");
                    self.spawn_sync("gap");
                }
            }
            PushEvent::Chat(chat) => {
                self.gap.record_contact(now);
                self.poll_gate.record_push(now);
                let message_id = chat.message_id;
                if let Err(err) = self.messages.receive(MessageRecord::from(chat)).await {
                    warn!(%message_id, error = %err, "failed to apply pushed message");
                }
            }
        }
    }

    /// Runs a pull of the active conversation off the driver task.
    fn spawn_sync(&mut self, reason: &'static str) {
        let active = *self.channels.active.borrow();
        if active.is_none() {
            debug!(reason, "no active conversation; skipping sync");
            return;
        }
        self.poll_gate.record_pull(Instant::now());
        let sync = self.sync.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let Err(err) = sync.pull(active).await else {
                return;
            };
            warn!(reason, error = %err, "sync pull failed");
            if err.is_unauthorized() {
                let reason = err
                    .api_exception()
                    .map_or_else(|| err.to_string(), |exception| exception.message.clone());
                let _ = events.send(ClientEvent::AuthenticationRejected { reason });
            }
        });
    }
}
