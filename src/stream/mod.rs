//! Push stream modules.
//!
//! - `transport`: the connection seam the session is written against.
//! - `client`: bundled websocket implementation of that seam.
//! - `proto`: event names and payloads exchanged on the namespace.
//! - `session`: one live connection with channel subscriptions.

/// Websocket transport.
pub mod client;
/// Stream protocol events and frames.
pub mod proto;
/// Session wrapper that subscribes channels and routes events.
pub mod session;
/// Transport traits and errors.
pub mod transport;
