//! WebSocket-backed connection
//!
//! `WsConnection` holds the sending side of a bounded per-connection channel
//! drained by the socket writer task. When the channel is full the connection
//! reports itself not ready, which is what lets the broker's subscriber queue
//! absorb a slow reader. A refused frame marks the connection backlogged so
//! the writer task can ask for a flush once it has drained. Closing stores the close frame and flips a watch
//! flag that both the reader and the writer task wait on.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::client::{Connection, ConnectionId, ConnectionState};

#[derive(Debug)]
pub struct WsConnection {
    id: ConnectionId,
    sender: mpsc::Sender<WsMessage>,
    state: AtomicU8,
    backlogged: AtomicBool,
    close_frame: Mutex<Option<CloseFrame>>,
    closed: watch::Sender<bool>,
}

impl WsConnection {
    /// Create a connection in the `Connecting` state around the writer channel.
    pub fn new(sender: mpsc::Sender<WsMessage>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            sender,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            backlogged: AtomicBool::new(false),
            close_frame: Mutex::new(None),
            closed,
        }
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// True if a frame was refused, or readiness denied, because the channel
    /// was full since the last call.
    pub fn take_backlogged(&self) -> bool {
        self.backlogged.swap(false, Ordering::AcqRel)
    }

    /// The close frame recorded by the first `close` call.
    pub fn take_close_frame(&self) -> Option<CloseFrame> {
        self.close_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Connection for WsConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        if self.sender.capacity() == 0 {
            self.backlogged.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn send(&self, frame: &str) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        match self.sender.try_send(WsMessage::text(frame.to_owned())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.backlogged.store(true, Ordering::Release);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match ConnectionState::from_u8(current) {
                    ConnectionState::Connecting | ConnectionState::Open => {
                        Some(ConnectionState::Closing as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();
        if !transitioned {
            return;
        }

        *self
            .close_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        });
        self.closed.send_replace(true);
    }
}
