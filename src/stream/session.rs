//! One live push connection and its channel subscriptions.
//!
//! `StreamSession` routes inbound events to the [`Dispatcher`] and reports
//! when the connection has ended. It never retries on its own; the session
//! manager decides what happens after [`SessionStatus::Ended`].

use std::collections::HashSet;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::PushServer;
use crate::dispatcher::Dispatcher;
use crate::retry::FailureCounter;
use crate::stream::proto::{
    AuthMatchMsg, InboundEvent, AUTH_FAILED, AUTH_MATCH, CONNECT_FAILED, DISCONNECT,
};
use crate::stream::transport::{Transport, TransportConnection, TransportError};

/// Why a session stopped being usable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionEnd {
    Disconnected,
    AuthFailed,
    ConnectFailed,
}

/// Outcome of handling one inbound event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    Continue,
    /// The session asked to be torn down and replaced.
    Ended(SessionEnd),
}

/// Stateful wrapper around one transport connection.
#[derive(Debug)]
pub struct StreamSession<C> {
    server: PushServer,
    connection: C,
    access_token: SecretString,
    channels: Vec<String>,
    subscribed: HashSet<String>,
    connected: bool,
    closed: bool,
}

impl<C: TransportConnection> StreamSession<C> {
    /// Opens the namespace on `server`, carrying the token and the channel
    /// snapshot that will be subscribed once the connection is confirmed.
    pub async fn open<T>(
        transport: &mut T,
        server: &PushServer,
        namespace: &str,
        access_token: SecretString,
        channels: Vec<String>,
    ) -> Result<Self, TransportError>
    where
        T: Transport<Connection = C>,
    {
        let connection = transport.connect(server, namespace).await?;
        debug!(
            event = "session_opened",
            server = %server,
            namespace,
            channels = channels.len()
        );
        Ok(Self {
            server: server.clone(),
            connection,
            access_token,
            channels,
            subscribed: HashSet::new(),
            connected: false,
            closed: false,
        })
    }

    pub fn server(&self) -> &PushServer {
        &self.server
    }

    /// Returns `true` between the `connect` signal and the end of the session.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Channels subscribed on the current connection.
    pub fn subscribed(&self) -> usize {
        self.subscribed.len()
    }

    /// Waits for the next inbound event. Cancel-safe.
    ///
    /// A connection that ends without saying so is reported once as
    /// `disconnect`; after that the future never resolves.
    pub async fn next_event(&mut self) -> InboundEvent {
        if self.closed {
            return std::future::pending().await;
        }
        match self.connection.next_event().await {
            Some(event) => event,
            None => {
                self.closed = true;
                InboundEvent::Disconnect {
                    args: vec![Value::String("transport closed".to_string())],
                }
            }
        }
    }

    /// Applies one inbound event.
    ///
    /// The `connect` signal resets `conn_failures` and subscribes every
    /// channel of the snapshot. Update handlers run before this returns.
    pub async fn handle(
        &mut self,
        event: InboundEvent,
        dispatcher: &Dispatcher,
        conn_failures: &mut FailureCounter,
    ) -> Result<SessionStatus, TransportError> {
        match event {
            InboundEvent::Connect => {
                info!(event = "session_connected", server = %self.server);
                conn_failures.reset();
                self.connected = true;
                self.subscribed.clear();
                let channels = self.channels.clone();
                for match_id in &channels {
                    self.subscribe(match_id).await?;
                }
                Ok(SessionStatus::Continue)
            }
            InboundEvent::MatchUpdate(card) => {
                dispatcher.dispatch_update(card);
                Ok(SessionStatus::Continue)
            }
            InboundEvent::PastBallUpdate(ball) => {
                dispatcher.dispatch_past_ball_update(ball);
                Ok(SessionStatus::Continue)
            }
            InboundEvent::AuthFailed { args } => {
                dispatcher.raise_event(AUTH_FAILED, &args);
                Ok(self.request_reconnection(SessionEnd::AuthFailed))
            }
            InboundEvent::ConnectFailed { args } => {
                dispatcher.raise_event(CONNECT_FAILED, &args);
                Ok(self.request_reconnection(SessionEnd::ConnectFailed))
            }
            InboundEvent::Disconnect { args } => {
                dispatcher.raise_event(DISCONNECT, &args);
                Ok(self.request_reconnection(SessionEnd::Disconnected))
            }
            InboundEvent::Other { name, .. } => {
                debug!(event = "session_event_ignored", name = %name);
                Ok(SessionStatus::Continue)
            }
        }
    }

    /// Adds a channel to this session, subscribing it right away when the
    /// connection is up. Returns `true` when `auth_match` was emitted.
    pub async fn listen_match(&mut self, match_id: &str) -> Result<bool, TransportError> {
        if !self.channels.iter().any(|known| known == match_id) {
            self.channels.push(match_id.to_string());
        }
        if !self.connected {
            return Ok(false);
        }
        self.subscribe(match_id).await
    }

    /// Marks the session unusable. The manager performs the teardown.
    pub fn request_reconnection(&mut self, reason: SessionEnd) -> SessionStatus {
        if self.connected {
            info!(event = "session_reconnect_requested", server = %self.server, reason = ?reason);
        }
        self.connected = false;
        SessionStatus::Ended(reason)
    }

    /// Closes the transport. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.connection.close().await
    }

    async fn subscribe(&mut self, match_id: &str) -> Result<bool, TransportError> {
        if !self.subscribed.insert(match_id.to_string()) {
            return Ok(false);
        }
        let payload = serde_json::to_value(AuthMatchMsg {
            match_id: match_id.to_string(),
            access_token: self.access_token.expose_secret().clone(),
        })?;
        if let Err(err) = self.connection.emit(AUTH_MATCH, payload).await {
            warn!(event = "subscribe_failed", match_id, error = %err);
            self.subscribed.remove(match_id);
            return Err(err);
        }
        debug!(event = "channel_subscribed", match_id);
        Ok(true)
    }
}
