//! # FanBus
//!
//! `fanbus` is an in-memory publish/subscribe broker served over WebSockets.
//! Clients subscribe to named topics, publish JSON messages to them and
//! receive every message published after they joined, with an optional
//! replay of recent history. Each subscriber gets a bounded queue so one
//! slow reader cannot stall the others.
//!
//! ## Core Modules
//!
//! - `broker`: topics, subscriber queues with backpressure, replay history and fan-out.
//! - `client`: the `Connection` abstraction the broker delivers through.
//! - `config`: loading server, broker and log settings.
//! - `transport`: the JSON protocol, connection manager, heartbeat and WebSocket server.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
