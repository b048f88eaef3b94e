//! In-memory `Connection` for tests.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::client::{Connection, ConnectionHandle, ConnectionId, ConnectionState};

/// Records every frame it is sent. Readiness can be switched off to model a
/// subscriber that never drains.
#[derive(Debug)]
pub(crate) struct RecordingConnection {
    id: ConnectionId,
    state: AtomicU8,
    ready: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<String>>,
    closed_with: Mutex<Option<(u16, String)>>,
}

impl RecordingConnection {
    pub(crate) fn open() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            ready: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
        })
    }

    /// Open but with a permanently full transport buffer.
    pub(crate) fn stalled() -> Arc<Self> {
        let conn = Self::open();
        conn.set_ready(false);
        conn
    }

    pub(crate) fn connecting() -> Arc<Self> {
        let conn = Self::open();
        conn.set_state(ConnectionState::Connecting);
        conn
    }

    pub(crate) fn handle(self: &Arc<Self>) -> ConnectionHandle {
        self.clone()
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Reports ready but refuses every frame.
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn frames(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    /// Frames of the given `type`.
    pub(crate) fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["type"] == kind)
            .collect()
    }

    /// Ids of delivered `event` frames, in delivery order.
    pub(crate) fn event_ids(&self) -> Vec<String> {
        self.frames_of("event")
            .iter()
            .map(|f| f["message"]["id"].as_str().unwrap().to_string())
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub(crate) fn closed_with(&self) -> Option<(u16, String)> {
        self.closed_with.lock().unwrap().clone()
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open && self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &str) -> bool {
        if !self.is_ready() || self.failing.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(frame.to_string());
        true
    }

    fn close(&self, code: u16, reason: &str) {
        let mut closed = self.closed_with.lock().unwrap();
        if closed.is_none() {
            *closed = Some((code, reason.to_string()));
            self.set_state(ConnectionState::Closing);
        }
    }
}
