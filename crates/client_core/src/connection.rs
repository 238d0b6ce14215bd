//! Transport-agnostic connection lifecycle.
//!
//! [`ConnectionMachine`] is synchronous: the driver feeds it one
//! [`ConnectionInput`] at a time and executes the returned
//! [`ConnectionAction`]s. Every transition is guarded by the link generation,
//! the armed timer handle and the expected source state, so duplicate or
//! out-of-order transport events are harmless.

use std::{fmt, sync::Arc, time::Duration};

use shared::domain::TransportKind;
use tracing::{debug, info, warn};

use crate::scheduler::{Scheduler, TimerHandle, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub growth: f64,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            growth: 1.5,
            cap: Duration::from_millis(30_000),
        }
    }
}

impl Backoff {
    /// `min(base * growth^attempt, cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.growth.powi(exponent);
        let capped = scaled.min(self.cap.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.cap
        }
    }
}

/// Generation number of one transport connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LinkId(pub u64);

impl LinkId {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    TransportOpen,
    Authenticating,
    Authenticated,
    Reconnecting {
        attempt: u32,
    },
}

impl ConnectionState {
    fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::TransportOpen | Self::Authenticating | Self::Authenticated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInput {
    Connect,
    Disconnect,
    TransportOpened { link: LinkId },
    TransportClosed { link: LinkId },
    TransportFailed { link: LinkId, reason: String },
    AuthAccepted { link: LinkId },
    AuthRejected { link: LinkId, reason: String },
    TimerFired(TimerHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Close any previous transport handle, then open `link`.
    OpenTransport { link: LinkId },
    CloseTransport,
    SendAuth,
    SendHeartbeat,
    StartSync,
    Poll,
    NotifyConnectivity(bool),
    SurfaceAuthRejected(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub transport: TransportKind,
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Runs the polling fallback for the push-stream transport.
    pub constrained: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Socket,
            backoff: Backoff::default(),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(3),
            constrained: false,
        }
    }
}

pub struct ConnectionMachine {
    config: ConnectionConfig,
    scheduler: Arc<dyn Scheduler>,
    state: ConnectionState,
    link: LinkId,
    last_attempt: Option<u32>,
    reconnect_timer: Option<TimerHandle>,
    heartbeat_timer: Option<TimerHandle>,
    poll_timer: Option<TimerHandle>,
}

impl ConnectionMachine {
    pub fn new(config: ConnectionConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            state: ConnectionState::Disconnected,
            link: LinkId::default(),
            last_attempt: None,
            reconnect_timer: None,
            heartbeat_timer: None,
            poll_timer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.config.transport
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    /// Attempt number of the most recent reconnect, if any failure happened
    /// since the last successful authentication.
    pub fn reconnect_attempt(&self) -> Option<u32> {
        self.last_attempt
    }

    pub fn handle(&mut self, input: ConnectionInput) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        match input {
            ConnectionInput::Connect => self.connect(&mut actions),
            ConnectionInput::Disconnect => self.disconnect(&mut actions),
            ConnectionInput::TransportOpened { link } => {
                if link != self.link || self.state != ConnectionState::Connecting {
                    debug!(%link, current = %self.link, state = ?self.state, "ignoring transport open");
                    return actions;
                }
                self.state = ConnectionState::TransportOpen;
                match self.config.transport {
                    TransportKind::Socket => {
                        self.state = ConnectionState::Authenticating;
                        actions.push(ConnectionAction::SendAuth);
                    }
                    TransportKind::PushStream => self.enter_authenticated(&mut actions),
                }
            }
            ConnectionInput::AuthAccepted { link } => {
                if link != self.link || self.state != ConnectionState::Authenticating {
                    debug!(%link, state = ?self.state, "ignoring auth acceptance");
                    return actions;
                }
                self.enter_authenticated(&mut actions);
            }
            ConnectionInput::AuthRejected { link, reason } => {
                if link != self.link || !self.state.is_live() {
                    debug!(%link, state = ?self.state, "ignoring auth rejection");
                    return actions;
                }
                warn!(%link, %reason, "server rejected credential");
                actions.push(ConnectionAction::CloseTransport);
                actions.push(ConnectionAction::SurfaceAuthRejected(reason));
                self.enter_reconnecting(&mut actions);
            }
            ConnectionInput::TransportClosed { link } => {
                self.on_link_down(link, "closed", &mut actions);
            }
            ConnectionInput::TransportFailed { link, reason } => {
                self.on_link_down(link, &reason, &mut actions);
            }
            ConnectionInput::TimerFired(handle) => self.on_timer(handle, &mut actions),
        }
        actions
    }

    fn connect(&mut self, actions: &mut Vec<ConnectionAction>) {
        if let Some(timer) = self.reconnect_timer.take() {
            self.scheduler.cancel(timer);
        }
        if self.state == ConnectionState::Authenticated {
            self.leave_authenticated(actions);
        }
        self.link = self.link.next();
        self.state = ConnectionState::Connecting;
        info!(link = %self.link, transport = ?self.config.transport, "connecting");
        actions.push(ConnectionAction::OpenTransport { link: self.link });

        if self.config.transport == TransportKind::PushStream
            && self.config.constrained
            && self.poll_timer.is_none()
        {
            self.poll_timer = Some(
                self.scheduler
                    .schedule_repeating(TimerKind::Poll, self.config.poll_interval),
            );
        }
    }

    fn disconnect(&mut self, actions: &mut Vec<ConnectionAction>) {
        for timer in [
            self.reconnect_timer.take(),
            self.heartbeat_timer.take(),
            self.poll_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.scheduler.cancel(timer);
        }
        if self.state == ConnectionState::Authenticated {
            actions.push(ConnectionAction::NotifyConnectivity(false));
        }
        if self.state != ConnectionState::Disconnected {
            actions.push(ConnectionAction::CloseTransport);
            info!(link = %self.link, "disconnected by operator");
        }
        self.last_attempt = None;
        self.link = self.link.next();
        self.state = ConnectionState::Disconnected;
    }

    fn on_link_down(&mut self, link: LinkId, reason: &str, actions: &mut Vec<ConnectionAction>) {
        if link != self.link || !self.state.is_live() {
            debug!(%link, state = ?self.state, "ignoring transport loss");
            return;
        }
        warn!(%link, %reason, state = ?self.state, "transport lost");
        actions.push(ConnectionAction::CloseTransport);
        self.enter_reconnecting(actions);
    }

    fn on_timer(&mut self, handle: TimerHandle, actions: &mut Vec<ConnectionAction>) {
        match handle.kind {
            TimerKind::Reconnect if self.reconnect_timer == Some(handle) => {
                self.reconnect_timer = None;
                self.connect(actions);
            }
            TimerKind::Heartbeat if self.heartbeat_timer == Some(handle) => {
                if self.is_authenticated() {
                    actions.push(ConnectionAction::SendHeartbeat);
                }
            }
            TimerKind::Poll if self.poll_timer == Some(handle) => {
                actions.push(ConnectionAction::Poll);
            }
            _ => debug!(timer_id = handle.id, kind = ?handle.kind, "stale timer firing"),
        }
    }

    fn enter_authenticated(&mut self, actions: &mut Vec<ConnectionAction>) {
        self.state = ConnectionState::Authenticated;
        self.last_attempt = None;
        if let Some(timer) = self.heartbeat_timer.take() {
            self.scheduler.cancel(timer);
        }
        self.heartbeat_timer = Some(
            self.scheduler
                .schedule_repeating(TimerKind::Heartbeat, self.config.heartbeat_interval),
        );
        info!(link = %self.link, "authenticated");
        actions.push(ConnectionAction::NotifyConnectivity(true));
        if self.config.transport == TransportKind::Socket {
            actions.push(ConnectionAction::StartSync);
        }
    }

    fn leave_authenticated(&mut self, actions: &mut Vec<ConnectionAction>) {
        if let Some(timer) = self.heartbeat_timer.take() {
            self.scheduler.cancel(timer);
        }
        actions.push(ConnectionAction::NotifyConnectivity(false));
    }

    fn enter_reconnecting(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.state == ConnectionState::Authenticated {
            self.leave_authenticated(actions);
        }
        let attempt = self.last_attempt.map_or(0, |previous| previous.saturating_add(1));
        let delay = self.config.backoff.delay(attempt);
        self.last_attempt = Some(attempt);
        self.state = ConnectionState::Reconnecting { attempt };
        if let Some(timer) = self.reconnect_timer.take() {
            self.scheduler.cancel(timer);
        }
        self.reconnect_timer = Some(self.scheduler.schedule_once(TimerKind::Reconnect, delay));
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
