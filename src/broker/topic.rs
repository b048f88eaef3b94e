//! Topic management
//!
//! A `Topic` holds the subscribers of one topic name, keyed by client
//! identity, and a bounded ring buffer of the most recently published
//! messages used for replay.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the broker
//! keeps every topic behind its registry lock).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::broker::message::Message;
use crate::client::ConnectionHandle;

pub type ClientId = String;

#[derive(Debug)]
pub struct Topic {
    pub name: String,
    subscribers: BTreeMap<ClientId, ConnectionHandle>,
    messages: VecDeque<Arc<Message>>,
    max_messages: usize,
    created_at: i64,
}

/// Read-only view of a topic handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSnapshot {
    pub name: String,
    pub subscribers: usize,
    pub messages: usize,
    pub created_at: i64,
}

impl Topic {
    /// Create a new topic whose ring buffer holds at most `max_messages`.
    pub fn new(name: &str, max_messages: usize, created_at: i64) -> Self {
        Self {
            name: name.to_string(),
            subscribers: BTreeMap::new(),
            messages: VecDeque::new(),
            max_messages,
            created_at,
        }
    }

    /// Returns false if the client already has a subscription here.
    pub fn subscribe(&mut self, id: ClientId, connection: ConnectionHandle) -> bool {
        if self.subscribers.contains_key(&id) {
            return false;
        }
        self.subscribers.insert(id, connection);
        true
    }

    pub fn unsubscribe(&mut self, id: &str) -> Option<ConnectionHandle> {
        self.subscribers.remove(id)
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = (&ClientId, &ConnectionHandle)> {
        self.subscribers.iter()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Appends to the ring buffer, evicting the oldest entries past capacity.
    pub fn append(&mut self, message: Arc<Message>) {
        self.messages.push_back(message);
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &Arc<Message>> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        TopicSnapshot {
            name: self.name.clone(),
            subscribers: self.subscribers.len(),
            messages: self.messages.len(),
            created_at: self.created_at,
        }
    }

    /// Empties the topic, handing back its subscribers.
    pub(crate) fn drain_subscribers(&mut self) -> BTreeMap<ClientId, ConnectionHandle> {
        std::mem::take(&mut self.subscribers)
    }
}
