use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use shared::domain::{
    ConversationId, LocalId, MessageId, MessageKind, PresenceStatus, SessionUser, TransportKind,
    UserId,
};
use storage::{CachedConversation, CachedMessage, LocalCache};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod api;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod outgoing;
mod runtime;
pub mod scheduler;
pub mod sync;
pub mod transport;

pub use api::{HttpMessageApi, MessageApi};
pub use auth::{AuthProvider, SessionAuth};
pub use config::{load_settings, load_settings_from, ClientSettings, DeviceClass};
pub use connection::ConnectionState;
pub use error::ClientError;
pub use transport::SendOutcome;

use crate::{
    connection::ConnectionMachine,
    outgoing::MessageCoordinator,
    runtime::{Command, Driver, DriverChannels},
    scheduler::TokioScheduler,
    sync::{DeviceClassifier, GapDetector, PollGate, SyncCoordinator},
    transport::{LinkEventSender, PushStreamTransport, SocketTransport, Transport},
};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectivityChanged {
        connected: bool,
    },
    MessageReceived {
        message: CachedMessage,
    },
    MessageDeleted {
        local_id: LocalId,
    },
    MessageFailed {
        local_id: LocalId,
        reason: String,
    },
    AuthenticationRejected {
        reason: String,
    },
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<SessionUser, ClientError>;
    async fn connect(&self) -> Result<(), ClientError>;
    async fn disconnect(&self) -> Result<(), ClientError>;
    async fn logout(&self) -> Result<(), ClientError>;
    async fn select_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<CachedMessage>, ClientError>;
    async fn load_conversations(&self) -> Result<Vec<CachedConversation>, ClientError>;
    async fn load_history(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<CachedMessage>, ClientError>;
    async fn open_conversation_with(
        &self,
        user_id: UserId,
    ) -> Result<CachedConversation, ClientError>;
    async fn submit_text(
        &self,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<CachedMessage, ClientError>;
    async fn submit_media(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        media_id: &str,
    ) -> Result<CachedMessage, ClientError>;
    async fn retry(&self, local_id: LocalId) -> Result<CachedMessage, ClientError>;
    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), ClientError>;
    async fn set_presence(&self, status: PresenceStatus) -> Result<SendOutcome, ClientError>;
    fn connection_state(&self) -> ConnectionState;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct RealtimeClient {
    cache: Arc<dyn LocalCache>,
    api: Arc<dyn MessageApi>,
    auth: Arc<SessionAuth>,
    messages: Arc<MessageCoordinator>,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    active: watch::Sender<Option<ConversationId>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Builds a client talking HTTP to `settings.server_url` over the
    /// configured transport. Must be called from within a tokio runtime.
    pub fn new(settings: ClientSettings, cache: Arc<dyn LocalCache>) -> Arc<Self> {
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to default http client");
                Client::new()
            });
        let auth = Arc::new(SessionAuth::new());
        let api = Arc::new(HttpMessageApi::new(
            http.clone(),
            settings.server_base(),
            auth.clone(),
        ));
        let classifier = settings.classifier();
        let transport_kind = settings.transport;
        let ws_url = settings.ws_url();
        let server_url = settings.server_base();

        Self::new_with_dependencies(
            &settings,
            cache,
            api,
            auth,
            classifier,
            move |events| -> Arc<dyn Transport> {
                match transport_kind {
                    TransportKind::Socket => Arc::new(SocketTransport::new(ws_url, events)),
                    TransportKind::PushStream => {
                        Arc::new(PushStreamTransport::new(http, server_url, events))
                    }
                }
            },
        )
    }

    pub fn new_with_dependencies<F>(
        settings: &ClientSettings,
        cache: Arc<dyn LocalCache>,
        api: Arc<dyn MessageApi>,
        auth: Arc<SessionAuth>,
        classifier: Arc<dyn DeviceClassifier>,
        build_transport: F,
    ) -> Arc<Self>
    where
        F: FnOnce(LinkEventSender) -> Arc<dyn Transport>,
    {
        let (events, _) = broadcast::channel(1024);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (active_tx, active_rx) = watch::channel(None);

        let messages = Arc::new(MessageCoordinator::new(
            cache.clone(),
            api.clone(),
            auth.clone(),
            events.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            cache.clone(),
            api.clone(),
            messages.clone(),
            settings.sync_batch_size,
        ));

        let constrained = classifier.is_constrained();
        let transport = build_transport(link_tx);
        let machine = ConnectionMachine::new(
            settings.connection_config(constrained),
            Arc::new(TokioScheduler::new(timer_tx)),
        );
        info!(
            transport = ?transport.kind(),
            constrained,
            "starting client driver"
        );
        let driver = Driver::new(
            machine,
            transport,
            auth.clone(),
            messages.clone(),
            sync,
            events.clone(),
            GapDetector::new(settings.gap_threshold()),
            PollGate::new(settings.poll_min_interval(), settings.push_window()),
            DriverChannels {
                commands: command_rx,
                link_events: link_rx,
                timers: timer_rx,
                state: state_tx,
                active: active_rx,
            },
        );
        let driver = tokio::spawn(driver.run());

        Arc::new(Self {
            cache,
            api,
            auth,
            messages,
            events,
            commands: command_tx,
            state: state_rx,
            active: active_tx,
            driver: Mutex::new(Some(driver)),
        })
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::DriverStopped)
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        *self.active.borrow()
    }

    /// Resolves once the connection reaches a state matching `predicate`.
    pub async fn wait_for_state<P>(&self, predicate: P) -> Result<ConnectionState, ClientError>
    where
        P: Fn(&ConnectionState) -> bool,
    {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| ClientError::DriverStopped)?;
        Ok(*reached)
    }

    /// Disconnects and waits for the driver task to finish.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "client driver panicked");
            }
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<RealtimeClient> {
    async fn login(&self, username: &str, password: &str) -> Result<SessionUser, ClientError> {
        let response = self
            .api
            .login(username, password)
            .await
            .map_err(ClientError::Request)?;
        self.auth
            .set_session(response.user.clone(), response.token);
        info!(user_id = %response.user.id, "logged in");
        Ok(response.user)
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if self.auth.token().is_none() {
            return Err(ClientError::MissingCredential);
        }
        self.command(Command::Connect)
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)?;
        self.active.send_replace(None);
        self.cache.clear().await.map_err(ClientError::Cache)?;
        self.auth.clear();
        info!("logged out");
        Ok(())
    }

    async fn select_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<CachedMessage>, ClientError> {
        self.active.send_replace(Some(conversation_id));
        self.command(Command::SyncNow)?;
        self.cache
            .messages_by_conversation(conversation_id)
            .await
            .map_err(ClientError::Cache)
    }

    async fn load_conversations(&self) -> Result<Vec<CachedConversation>, ClientError> {
        let records = self
            .api
            .list_conversations()
            .await
            .map_err(ClientError::Request)?;
        for record in records {
            self.cache
                .put_conversation(&CachedConversation::from(record))
                .await
                .map_err(ClientError::Cache)?;
        }
        self.cache.conversations().await.map_err(ClientError::Cache)
    }

    async fn load_history(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<CachedMessage>, ClientError> {
        let page = self
            .api
            .fetch_messages_before(conversation_id, before, limit)
            .await
            .map_err(ClientError::Request)?;
        let mut loaded = Vec::with_capacity(page.messages.len());
        for record in page.messages {
            self.messages.receive(record.clone()).await?;
            loaded.push(CachedMessage::from(record));
        }
        Ok(loaded)
    }

    async fn open_conversation_with(
        &self,
        user_id: UserId,
    ) -> Result<CachedConversation, ClientError> {
        let record = self
            .api
            .conversation_with(user_id)
            .await
            .map_err(ClientError::Request)?;
        let conversation = CachedConversation::from(record);
        self.cache
            .put_conversation(&conversation)
            .await
            .map_err(ClientError::Cache)?;
        Ok(conversation)
    }

    async fn submit_text(
        &self,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<CachedMessage, ClientError> {
        self.messages
            .submit(conversation_id, text, MessageKind::Text)
            .await
    }

    async fn submit_media(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        media_id: &str,
    ) -> Result<CachedMessage, ClientError> {
        self.messages.submit(conversation_id, media_id, kind).await
    }

    async fn retry(&self, local_id: LocalId) -> Result<CachedMessage, ClientError> {
        self.messages.retry(local_id).await
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.api
            .mark_read(conversation_id)
            .await
            .map_err(ClientError::Request)?;
        let cached = self
            .cache
            .conversation(conversation_id)
            .await
            .map_err(ClientError::Cache)?;
        if let Some(conversation) = cached {
            self.cache
                .put_conversation(&CachedConversation {
                    unread_count: 0,
                    ..conversation
                })
                .await
                .map_err(ClientError::Cache)?;
        }
        Ok(())
    }

    async fn set_presence(&self, status: PresenceStatus) -> Result<SendOutcome, ClientError> {
        let (reply, outcome) = oneshot::channel();
        self.command(Command::SetPresence { status, reply })?;
        outcome.await.map_err(|_| ClientError::DriverStopped)
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
