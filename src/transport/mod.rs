//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! It defines the JSON protocol spoken between clients and the server, the
//! connection manager that validates requests and forwards them to the
//! broker, the heartbeat task, and the WebSocket server itself.

pub mod connection;
pub mod heartbeat;
pub mod message;
pub mod websocket;

pub use connection::{ConnectionInfo, ConnectionManager};
pub use heartbeat::HeartbeatScheduler;
pub use message::{AckStatus, ClientMessage, Request, ServerMessage};


#[cfg(test)]
mod websocket_tests;
