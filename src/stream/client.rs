//! Websocket implementation of the transport seam.
//!
//! Each connection targets `ws://<host>:<port><namespace>` and exchanges
//! JSON text frames of the form `{"name": "<event>", "args": [...]}`. The
//! `connect` signal is produced locally once the websocket handshake
//! completes; every way the socket can end is reported as `disconnect`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::auth::PushServer;
use crate::config::PushDefaults;
use crate::stream::proto::{InboundEvent, WireFrame};
use crate::stream::transport::{Transport, TransportConnection, TransportError};

/// Opens websocket connections to push servers.
#[derive(Clone, Debug)]
pub struct WsTransport {
    secure: bool,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            secure: false,
            connect_timeout: PushDefaults::CONNECT_TIMEOUT,
        }
    }

    /// Uses `wss://` instead of `ws://`.
    pub fn with_tls(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn url(&self, server: &PushServer, namespace: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{namespace}", server.host, server.port)
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    type Connection = WsConnection;

    async fn connect(
        &mut self,
        server: &PushServer,
        namespace: &str,
    ) -> Result<WsConnection, TransportError> {
        let url = self.url(server, namespace);
        debug!(event = "ws_connecting", url = %url);

        let socket = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await
        {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(err)) => {
                return Err(TransportError::Connect {
                    server: server.to_string(),
                    reason: err.to_string(),
                })
            }
            Err(_) => return Err(TransportError::Timeout(server.to_string())),
        };

        Ok(WsConnection {
            socket,
            pending: VecDeque::from([InboundEvent::Connect]),
            closed: false,
        })
    }
}

/// Live websocket namespace connection.
#[derive(Debug)]
pub struct WsConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<InboundEvent>,
    closed: bool,
}

impl WsConnection {
    fn lost(&mut self, reason: String) -> InboundEvent {
        self.closed = true;
        InboundEvent::Disconnect {
            args: vec![Value::String(reason)],
        }
    }
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn emit(&mut self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let text = WireFrame::new(event, vec![payload]).to_text()?;
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<InboundEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.closed {
            return None;
        }

        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => match WireFrame::from_text(&text) {
                    Ok(frame) => return Some(frame.into_event()),
                    Err(err) => warn!(event = "ws_frame_unparseable", error = %err),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                        return Some(self.lost(err.to_string()));
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Binary(_))) => debug!(event = "ws_binary_frame_ignored"),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "server closed the connection".to_string());
                    return Some(self.lost(reason));
                }
                Some(Err(err)) => return Some(self.lost(err.to_string())),
                None => return Some(self.lost("socket ended".to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.socket.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WsTransport;
    use crate::auth::PushServer;

    #[test]
    fn url_targets_namespace_on_push_server() {
        let transport = WsTransport::new();
        assert_eq!(
            transport.url(&PushServer::new("push1.litzscore.com", 8080), "/stream"),
            "ws://push1.litzscore.com:8080/stream"
        );
    }

    #[test]
    fn tls_switches_scheme() {
        let transport = WsTransport::default().with_tls(true);
        assert_eq!(
            transport.url(&PushServer::new("h1", 443), "/stream"),
            "wss://h1:443/stream"
        );
    }
}
