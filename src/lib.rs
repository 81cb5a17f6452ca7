//! Self-healing client for the Litzscore live-score push feed.
//!
//! The crate is organized by surface:
//! - `config`: client configuration, defaults and device identity.
//! - `auth`: token exchange, token expiry tracking and the HTTP seam.
//! - `registry`: the set of match channels replayed on every connection.
//! - `dispatcher`: routing of updates and lifecycle events to handlers.
//! - `stream`: transport seam, websocket transport, wire events and the
//!   per-connection session.
//! - `manager`: the reconnecting session manager.
//! - `retry`: failure counters and the bounded retry loop.

/// Token exchange and token store.
pub mod auth;
/// Client configuration.
pub mod config;
/// Event handler slots.
pub mod dispatcher;
/// Reconnecting session manager.
pub mod manager;
/// Match channel registry.
pub mod registry;
/// Failure counters and retry helpers shared by the auth and connection paths.
pub mod retry;
/// Push stream transport, protocol types and session.
pub mod stream;

pub use auth::{AccessToken, AuthError, AuthHttp, PushServer, ReqwestAuthHttp, TokenStore};
pub use config::{DeviceIdentity, PushConfig, PushDefaults};
pub use dispatcher::Dispatcher;
pub use manager::{PushError, PushHandle, SessionManager, SessionState};
pub use registry::ChannelRegistry;
pub use stream::client::WsTransport;
