//! The `client` module defines how the broker sees a connected client.
//!
//! The broker never talks to sockets directly. It holds [`ConnectionHandle`]s,
//! shared references to something implementing [`Connection`]: a text frame
//! sink with a readiness flag and a way to close it. [`WsConnection`] is the
//! WebSocket implementation used by the server.

pub mod ws_connection;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

pub use ws_connection::WsConnection;

/// Close code sent when the subscribed topic is deleted.
pub const CLOSE_TOPIC_DELETED: u16 = 4001;
/// Close code sent to a subscriber whose queue overflowed under the
/// `disconnect` policy.
pub const CLOSE_SLOW_CONSUMER: u16 = 1008;
/// Close code sent on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NORMAL: u16 = 1000;

/// Server-generated identity of one live socket. Never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a connection. Only `Open` connections accept protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> &ConnectionId;

    fn state(&self) -> ConnectionState;

    /// Used by the connection manager to move `Connecting -> Open` and,
    /// once teardown is done, to `Closed`.
    fn set_state(&self, state: ConnectionState);

    /// True when the connection is open and can take a frame right now.
    fn is_ready(&self) -> bool;

    /// Hands a text frame to the transport without waiting.
    /// Returns false if the connection is not open or cannot take it.
    fn send(&self, frame: &str) -> bool;

    /// Starts closing the connection. Only the first call has an effect.
    fn close(&self, code: u16, reason: &str);
}

pub type ConnectionHandle = Arc<dyn Connection>;
