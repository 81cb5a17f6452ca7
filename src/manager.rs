//! Self-healing push session.
//!
//! [`SessionManager::connect`] runs the whole lifecycle on the caller's task:
//! obtain a usable token, open a [`StreamSession`] on the first push server,
//! wait on a single `select!` over the token deadline, inbound events, queued
//! channel additions and cancellation, then tear down and go around again.
//! Only an exhausted failure counter or refused push access end the loop
//! with an error; [`PushHandle::stop`] ends it cleanly.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::auth::{
    AccessToken, AuthError, AuthHttp, ReqwestAuthHttp, TokenFetcher, TokenStore,
};
use crate::config::{DeviceIdentity, PushConfig};
use crate::dispatcher::Dispatcher;
use crate::registry::ChannelRegistry;
use crate::retry::FailureCounter;
use crate::stream::client::WsTransport;
use crate::stream::proto::{InboundEvent, CONNECT_FAILED};
use crate::stream::session::{SessionEnd, SessionStatus, StreamSession};
use crate::stream::transport::Transport;

/// Lifecycle state of a [`SessionManager`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Created but `connect` not called yet.
    Idle,
    /// Fetching an access token.
    Authenticating,
    /// Opening the push namespace.
    Connecting,
    /// The server confirmed the connection and channels are subscribed.
    Connected,
    /// The token reached its refresh threshold.
    Expiring,
    /// The session ended because of a transport or auth event.
    Faulted,
    /// Waiting out the retry delay before the next attempt.
    Reconnecting,
    /// Stopped by the caller.
    Stopped,
    /// A failure counter was exhausted or push access was refused.
    Failed,
}

/// Terminal errors returned by [`SessionManager::connect`].
#[derive(Debug, Error)]
pub enum PushError {
    /// The authentication failure counter was exhausted.
    #[error("no access token after {failures} failed attempts")]
    NoAccessToken { failures: u32 },

    /// The API refused the credentials or granted no push servers.
    #[error("push access refused: {0}")]
    PushAccess(AuthError),

    /// The connection failure counter was exhausted.
    #[error("connection failed {failures} times in a row")]
    ConnectionRetriesExhausted { failures: u32 },

    #[error("failed to initialize client: {0}")]
    Init(AuthError),

    /// The manager behind a [`PushHandle`] has been dropped.
    #[error("session manager is gone")]
    Closed,
}

#[derive(Debug)]
enum Command {
    Listen(String),
}

/// Cloneable handle for a running [`SessionManager`].
#[derive(Clone, Debug)]
pub struct PushHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl PushHandle {
    /// Queues a channel addition. It is subscribed on the live session, if
    /// any, and replayed on every reconnect.
    pub fn listen_match(&self, match_id: impl Into<String>) -> Result<(), PushError> {
        self.commands
            .send(Command::Listen(match_id.into()))
            .map_err(|_| PushError::Closed)
    }

    /// Asks the manager to disconnect and return from `connect`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum Attempt {
    Reconnect { after: Duration },
    Stopped,
}

enum Wake {
    Cancelled,
    Listen(Option<Command>),
    Event(InboundEvent),
    Deadline,
}

/// Drives authentication, connection and reconnection for one client.
pub struct SessionManager<T: Transport, H> {
    config: PushConfig,
    device: DeviceIdentity,
    transport: T,
    fetcher: TokenFetcher<H>,
    tokens: TokenStore,
    registry: ChannelRegistry,
    dispatcher: Dispatcher,
    conn_failures: FailureCounter,
    session: Option<StreamSession<T::Connection>>,
    state: watch::Sender<SessionState>,
    reconnects: u64,
    cancel: CancellationToken,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    span: Span,
}

impl SessionManager<WsTransport, ReqwestAuthHttp> {
    /// Builds a manager using `reqwest` for the token exchange and the
    /// bundled websocket transport.
    pub fn from_config(config: PushConfig, dispatcher: Dispatcher) -> Result<Self, PushError> {
        let http = ReqwestAuthHttp::new(config.connect_timeout).map_err(PushError::Init)?;
        let transport = WsTransport::new().with_connect_timeout(config.connect_timeout);
        Ok(Self::new(config, dispatcher, transport, http))
    }
}

impl<T, H> SessionManager<T, H>
where
    T: Transport,
    H: AuthHttp,
{
    pub fn new(config: PushConfig, dispatcher: Dispatcher, transport: T, http: H) -> Self {
        let device = config.device_identity();
        let span = config.span.clone().unwrap_or_else(|| {
            info_span!(
                "push_session",
                app_id = %config.app_id,
                device_id = %device
            )
        });
        let fetcher = TokenFetcher::new(http, &config, device.clone());
        let tokens = TokenStore::new(config.expiry_margin, config.min_token_lifetime);
        let (state, _) = watch::channel(SessionState::Idle);
        let (commands_tx, commands) = mpsc::unbounded_channel();

        Self {
            conn_failures: config.conn_retry.counter(),
            config,
            device,
            transport,
            fetcher,
            tokens,
            registry: ChannelRegistry::new(),
            dispatcher,
            session: None,
            state,
            reconnects: 0,
            cancel: CancellationToken::new(),
            commands_tx,
            commands,
            span,
        }
    }

    /// Returns a handle that can add channels or stop the manager from any
    /// task while `connect` is running.
    pub fn handle(&self) -> PushHandle {
        PushHandle {
            commands: self.commands_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Registers a channel for the next session.
    pub fn listen_match(&mut self, match_id: impl Into<String>) -> bool {
        self.registry.add(match_id)
    }

    pub fn channels(&self) -> Vec<String> {
        self.registry.snapshot()
    }

    pub fn device_identity(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Number of reconnects issued since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    pub fn auth_failures(&self) -> FailureCounter {
        self.fetcher.failures()
    }

    pub fn conn_failures(&self) -> FailureCounter {
        self.conn_failures
    }

    /// Adds `matches` to the registry and keeps a session alive until the
    /// caller stops it or a failure domain is exhausted.
    pub async fn connect(&mut self, matches: Option<Vec<String>>) -> Result<(), PushError> {
        let span = self.span.clone();
        self.run(matches).instrument(span).await
    }

    /// Tears down the live session, if any. Teardown errors are logged and
    /// dropped; calling this without a session does nothing.
    pub async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(err) = session.close().await {
            debug!(event = "session_close_failed", server = %session.server(), error = %err);
        }
        info!(event = "session_closed", server = %session.server());
    }

    async fn run(&mut self, matches: Option<Vec<String>>) -> Result<(), PushError> {
        if let Some(matches) = matches {
            self.registry.extend(matches);
        }
        info!(event = "push_connect", channels = self.registry.len());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.attempt().await {
                Ok(Attempt::Stopped) => break,
                Ok(Attempt::Reconnect { after }) => {
                    self.reconnect().await;
                    if !self.pause(after).await {
                        break;
                    }
                }
                Err(err) => {
                    self.disconnect().await;
                    error!(event = "push_failed", error = %err);
                    self.set_state(SessionState::Failed);
                    return Err(err);
                }
            }
        }

        self.disconnect().await;
        self.set_state(SessionState::Stopped);
        info!(event = "push_stopped");
        Ok(())
    }

    /// One pass through authenticate, open and wait.
    async fn attempt(&mut self) -> Result<Attempt, PushError> {
        self.drain_commands();

        let Some((token, lifetime)) = self.ensure_token().await? else {
            return Ok(Attempt::Stopped);
        };
        let min_lifetime = self.tokens.min_lifetime();
        let Some(server) = token.primary_server().cloned() else {
            return Err(PushError::PushAccess(AuthError::NoPushAccess));
        };
        let access_token = token.token().clone();

        self.set_state(SessionState::Connecting);
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Attempt::Stopped),
            opened = StreamSession::open(
                &mut self.transport,
                &server,
                &self.config.namespace,
                access_token,
                self.registry.snapshot(),
            ) => opened,
        };
        match opened {
            Ok(session) => self.session = Some(session),
            Err(err) => {
                warn!(event = "session_connect_failed", server = %server, error = %err);
                return self.connection_failed();
            }
        }

        let mut deadline = Instant::now() + self.session_wait(lifetime);
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(Attempt::Reconnect {
                    after: Duration::ZERO,
                });
            };
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                command = self.commands.recv() => Wake::Listen(command),
                event = session.next_event() => Wake::Event(event),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Cancelled => return Ok(Attempt::Stopped),
                Wake::Listen(Some(Command::Listen(match_id))) => {
                    self.add_live_channel(match_id).await;
                }
                Wake::Listen(None) => {}
                Wake::Event(event) => {
                    let handled = session
                        .handle(event, &self.dispatcher, &mut self.conn_failures)
                        .await;
                    match handled {
                        Ok(SessionStatus::Continue) => {
                            if session.is_connected() {
                                self.set_state(SessionState::Connected);
                            }
                        }
                        Ok(SessionStatus::Ended(end)) => {
                            self.set_state(SessionState::Faulted);
                            if end == SessionEnd::AuthFailed {
                                self.tokens.invalidate();
                            }
                            return self.connection_failed();
                        }
                        Err(err) => {
                            warn!(event = "session_emit_failed", error = %err);
                            self.set_state(SessionState::Faulted);
                            return self.connection_failed();
                        }
                    }
                }
                Wake::Deadline => {
                    let now = Instant::now();
                    let remaining = self.tokens.usable_lifetime(now).unwrap_or(Duration::ZERO);
                    if remaining <= min_lifetime {
                        info!(
                            event = "access_token_expiring",
                            remaining_secs = remaining.as_secs()
                        );
                        self.set_state(SessionState::Expiring);
                        return Ok(Attempt::Reconnect {
                            after: Duration::ZERO,
                        });
                    }
                    let wait = self.session_wait(remaining);
                    deadline = now + wait;
                    debug!(event = "wait_extended", wait_secs = wait.as_secs());
                }
            }
        }
    }

    /// Time until the session must be re-checked: the token's usable
    /// lifetime down to the refresh threshold, capped at `max_wait` unless
    /// that is zero.
    fn session_wait(&self, lifetime: Duration) -> Duration {
        let until_refresh = lifetime.saturating_sub(self.tokens.min_lifetime());
        if self.config.max_wait.is_zero() {
            until_refresh
        } else {
            self.config.max_wait.min(until_refresh)
        }
    }

    /// Returns a valid token and its usable lifetime, fetching one when
    /// needed. `None` means the caller stopped the manager meanwhile.
    async fn ensure_token(&mut self) -> Result<Option<(AccessToken, Duration)>, PushError> {
        loop {
            let now = Instant::now();
            if let Some(token) = self.tokens.get_valid_token(now) {
                let lifetime = self.tokens.usable_lifetime(now).unwrap_or(Duration::ZERO);
                return Ok(Some((token.clone(), lifetime)));
            }
            if self.tokens.is_stale(now) {
                debug!(event = "access_token_dropped");
                self.tokens.invalidate();
            }

            self.set_state(SessionState::Authenticating);
            let before = self.fetcher.failures();
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                fetched = self.fetcher.fetch() => fetched,
            };

            match fetched {
                Ok(token) => {
                    self.tokens.store(token);
                    if self.tokens.get_valid_token(Instant::now()).is_some() {
                        continue;
                    }
                    warn!(event = "access_token_stale_on_arrival");
                    if !self.fetcher.reject_token(before) {
                        return Err(self.no_access_token());
                    }
                    if !self.pause(self.fetcher.retry_delay()).await {
                        return Ok(None);
                    }
                }
                Err(AuthError::RetriesExhausted { .. }) => return Err(self.no_access_token()),
                Err(err) => return Err(PushError::PushAccess(err)),
            }
        }
    }

    fn no_access_token(&self) -> PushError {
        let err = PushError::NoAccessToken {
            failures: self.fetcher.failures().count(),
        };
        self.dispatcher
            .raise_event(CONNECT_FAILED, &[Value::String(err.to_string())]);
        err
    }

    /// Counts a connection-domain failure and schedules the retry.
    fn connection_failed(&mut self) -> Result<Attempt, PushError> {
        if self.conn_failures.record_failure() {
            warn!(
                event = "connection_retry_scheduled",
                failures = self.conn_failures.count(),
                max_failures = self.conn_failures.max(),
                delay_ms = self.config.conn_retry.delay.as_millis() as u64
            );
            Ok(Attempt::Reconnect {
                after: self.config.conn_retry.delay,
            })
        } else {
            Err(PushError::ConnectionRetriesExhausted {
                failures: self.conn_failures.count(),
            })
        }
    }

    async fn add_live_channel(&mut self, match_id: String) {
        if !self.registry.add(match_id.clone()) {
            return;
        }
        info!(event = "channel_added", match_id = %match_id);
        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.listen_match(&match_id).await {
                warn!(event = "channel_add_failed", match_id = %match_id, error = %err);
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(Command::Listen(match_id)) = self.commands.try_recv() {
            self.registry.add(match_id);
        }
    }

    /// Tears down the current session before the next attempt.
    async fn reconnect(&mut self) {
        self.disconnect().await;
        self.reconnects += 1;
        self.set_state(SessionState::Reconnecting);
        info!(event = "push_reconnect", reconnects = self.reconnects);
    }

    /// Sleeps for `delay` unless cancelled first. Returns `false` on cancel.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(event = "state_changed", from = ?previous, to = ?next);
        }
    }
}
