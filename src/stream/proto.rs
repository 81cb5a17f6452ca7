use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";
pub const CONNECT_FAILED: &str = "connect_failed";
pub const AUTH_FAILED: &str = "auth_failed";
pub const MATCH_UPDATE: &str = "match_update";
pub const PAST_BALL_UPDATE: &str = "past_ball_update";
/// Outbound subscription request, one per channel.
pub const AUTH_MATCH: &str = "auth_match";

/// Event received from the push namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connect,
    Disconnect { args: Vec<Value> },
    ConnectFailed { args: Vec<Value> },
    AuthFailed { args: Vec<Value> },
    MatchUpdate(Value),
    PastBallUpdate(Value),
    Other { name: String, args: Vec<Value> },
}

impl InboundEvent {
    /// Maps a named event and its arguments to a typed event.
    ///
    /// Update events carry their payload in the first argument.
    pub fn from_parts(name: &str, args: Vec<Value>) -> Self {
        match name {
            CONNECT => Self::Connect,
            DISCONNECT => Self::Disconnect { args },
            CONNECT_FAILED => Self::ConnectFailed { args },
            AUTH_FAILED => Self::AuthFailed { args },
            MATCH_UPDATE => Self::MatchUpdate(first_arg(args)),
            PAST_BALL_UPDATE => Self::PastBallUpdate(first_arg(args)),
            _ => Self::Other {
                name: name.to_string(),
                args,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Connect => CONNECT,
            Self::Disconnect { .. } => DISCONNECT,
            Self::ConnectFailed { .. } => CONNECT_FAILED,
            Self::AuthFailed { .. } => AUTH_FAILED,
            Self::MatchUpdate(_) => MATCH_UPDATE,
            Self::PastBallUpdate(_) => PAST_BALL_UPDATE,
            Self::Other { name, .. } => name,
        }
    }
}

fn first_arg(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or(Value::Null)
}

/// Payload of [`AUTH_MATCH`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthMatchMsg {
    #[serde(rename = "match")]
    pub match_id: String,
    pub access_token: String,
}

/// Named event frame exchanged by the bundled websocket transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl WireFrame {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn into_event(self) -> InboundEvent {
        InboundEvent::from_parts(&self.name, self.args)
    }
}
