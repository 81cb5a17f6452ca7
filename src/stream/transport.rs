//! Seam between the session layer and the streaming transport.
//!
//! A transport opens one bidirectional event channel per push server. The
//! session only needs to emit named events, pull inbound events one at a
//! time, and close the connection.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::auth::PushServer;
use crate::stream::proto::InboundEvent;

/// Opens connections to push servers.
#[async_trait]
pub trait Transport: Send {
    type Connection: TransportConnection;

    /// Connects to `server` and defines the namespace at `namespace`.
    ///
    /// An error here is a connect-time failure and counts against the
    /// connection failure budget.
    async fn connect(
        &mut self,
        server: &PushServer,
        namespace: &str,
    ) -> Result<Self::Connection, TransportError>;
}

/// One live namespace connection.
#[async_trait]
pub trait TransportConnection: Send {
    /// Emits `event` with a single JSON payload.
    async fn emit(&mut self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Waits for the next inbound event.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no
    /// event. Returns `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<InboundEvent>;

    /// Closes the connection. Closing twice is allowed.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Errors produced by a streaming transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection is closed")]
    Closed,
}
