//! Per-subscriber outbound queue
//!
//! Each client identity owns one `SubscriberQueue` shared by all of its
//! subscriptions. The queue is a logical, bounded FIFO: when it is full the
//! configured `BackpressurePolicy` decides whether the oldest pending message
//! is evicted or the new one is rejected. Eviction never depends on what the
//! transport has already buffered.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::broker::message::Envelope;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the head of the queue to make room for the new message.
    #[default]
    DropOldest,
    /// Refuse the new message; the owning connection must be closed.
    Disconnect,
}

/// Result of [`SubscriberQueue::add`].
#[derive(Debug)]
pub enum AddOutcome {
    /// The message was appended. `evicted` holds the message that was dropped
    /// to make room, if any.
    Added { evicted: Option<Envelope> },
    /// The queue is full and the policy is [`BackpressurePolicy::Disconnect`].
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub processed: u64,
}

#[derive(Debug)]
pub struct SubscriberQueue {
    items: VecDeque<Envelope>,
    capacity: usize,
    policy: BackpressurePolicy,
    dropped_count: u64,
    total_processed: u64,
}

impl SubscriberQueue {
    /// A zero capacity is treated as one so that a message can always be held.
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
            dropped_count: 0,
            total_processed: 0,
        }
    }

    pub fn add(&mut self, envelope: Envelope) -> AddOutcome {
        if self.items.len() < self.capacity {
            self.items.push_back(envelope);
            return AddOutcome::Added { evicted: None };
        }

        match self.policy {
            BackpressurePolicy::DropOldest => {
                let evicted = self.items.pop_front();
                self.items.push_back(envelope);
                self.dropped_count += 1;
                AddOutcome::Added { evicted }
            }
            BackpressurePolicy::Disconnect => AddOutcome::Rejected,
        }
    }

    /// Pops the oldest pending message.
    pub fn get_next(&mut self) -> Option<Envelope> {
        let next = self.items.pop_front();
        if next.is_some() {
            self.total_processed += 1;
        }
        next
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.items.front()
    }

    /// Discards every pending message published on `topic`.
    pub fn purge_topic(&mut self, topic: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|e| &*e.topic != topic);
        before - self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.items.len(),
            capacity: self.capacity,
            dropped: self.dropped_count,
            processed: self.total_processed,
        }
    }
}
