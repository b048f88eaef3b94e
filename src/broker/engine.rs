//! Broker engine
//!
//! This module contains the in-memory broker implementation responsible for:
//! - the topic registry (create/delete/get/list)
//! - subscriptions and the per-client subscriber queues
//! - publishing: ring-buffer append, fan-out and immediate delivery
//! - replay of recent messages at subscribe time
//!
//! Concurrency and usage notes:
//! - All registry state lives behind one mutex. Every mutation, including the
//!   subscriber snapshot taken during publish, happens inside that critical
//!   section, so no caller can observe a half-updated topic.
//! - Sends performed under the lock never wait: `Connection::send` hands the
//!   frame to the transport or fails immediately.
//! - Lifecycle events are collected under the lock and handed to the
//!   `EventSink` after it is released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::broker::events::{BrokerEvent, EventSink, TracingEvents};
use crate::broker::message::{Envelope, Message, NewMessage, now_millis};
use crate::broker::queue::{AddOutcome, QueueStats, SubscriberQueue};
use crate::broker::topic::{ClientId, Topic, TopicSnapshot};
use crate::client::{CLOSE_SLOW_CONSUMER, CLOSE_TOPIC_DELETED, ConnectionHandle};
use crate::config::BrokerSettings;
use crate::transport::message::ServerMessage;
use crate::utils::error::{BrokerError, Result};

/// Per-subscriber outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Handed to the subscriber's connection.
    Delivered,
    /// Waiting in the subscriber queue for the connection to become ready.
    Queued,
    /// The connection refused the frame; the message stays queued.
    Failed,
    /// The queue was full under the `disconnect` policy; the subscriber was
    /// disconnected.
    SlowConsumer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub client_id: ClientId,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub topic: String,
    pub message_id: String,
    pub subscribers: usize,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopicDeletion {
    pub subscribers_disconnected: usize,
    pub messages_lost: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub topics: usize,
    pub total_subscribers: usize,
    pub total_messages: usize,
    pub queue_stats: BTreeMap<ClientId, QueueStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub topics: usize,
    pub clients: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    clients: HashMap<ClientId, ClientState>,
}

/// Everything the broker tracks for one client identity. Exists while the
/// client holds at least one subscription.
#[derive(Debug)]
struct ClientState {
    queue: SubscriberQueue,
    topics: HashSet<String>,
    connection: ConnectionHandle,
}

enum Flush {
    Drained,
    Pending,
    Failed,
}

impl ClientState {
    /// Sends queued messages, oldest first, for as long as the connection
    /// takes them. A message leaves the queue only once it was sent.
    fn flush(&mut self, client_id: &str, events: &mut Vec<BrokerEvent>) -> Flush {
        while self.connection.is_ready() {
            let Some(front) = self.queue.peek() else {
                return Flush::Drained;
            };
            let frame = match ServerMessage::event(front, false).to_frame() {
                Ok(frame) => frame,
                Err(_) => {
                    if let Some(unsendable) = self.queue.get_next() {
                        events.push(delivery_failed(client_id, &unsendable));
                    }
                    continue;
                }
            };
            if !self.connection.send(&frame) {
                events.push(delivery_failed(client_id, front));
                return Flush::Failed;
            }
            self.queue.get_next();
        }

        if self.queue.is_empty() {
            Flush::Drained
        } else {
            Flush::Pending
        }
    }
}

fn delivery_failed(client_id: &str, envelope: &Envelope) -> BrokerEvent {
    BrokerEvent::DeliveryFailed {
        client_id: client_id.to_string(),
        topic: envelope.topic.to_string(),
        message_id: envelope.message.id.clone(),
    }
}

pub struct Broker {
    settings: BrokerSettings,
    state: Mutex<BrokerState>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("settings", &self.settings)
            .field("state", &self.state)
            .finish()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self::with_event_sink(settings, Arc::new(TracingEvents))
    }

    pub fn with_event_sink(settings: BrokerSettings, events: Arc<dyn EventSink>) -> Self {
        Self {
            settings,
            state: Mutex::new(BrokerState::default()),
            events,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` inside the registry critical section, then emits whatever
    /// events it collected.
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState, &mut Vec<BrokerEvent>) -> T) -> T {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state();
            f(&mut *state, &mut events)
        };
        for event in &events {
            self.events.emit(event);
        }
        result
    }

    /// Registers an empty topic. Returns false if the name is taken.
    pub fn create_topic(&self, name: &str) -> bool {
        self.with_state(|state, events| {
            if state.topics.contains_key(name) {
                return false;
            }
            let topic = Topic::new(name, self.settings.max_messages_per_topic, now_millis());
            state.topics.insert(name.to_string(), topic);
            events.push(BrokerEvent::TopicCreated {
                topic: name.to_string(),
            });
            true
        })
    }

    /// Closes every subscriber connection, drops the topic's subscriptions
    /// from client bookkeeping and removes the topic.
    pub fn delete_topic(&self, name: &str) -> Option<TopicDeletion> {
        self.with_state(|state, events| -> Option<TopicDeletion> {
            let mut topic = state.topics.remove(name)?;
            let subscribers = topic.drain_subscribers();

            for (client_id, connection) in &subscribers {
                connection.close(CLOSE_TOPIC_DELETED, "topic deleted");
                if let Some(client) = state.clients.get_mut(client_id) {
                    client.topics.remove(name);
                    client.queue.purge_topic(name);
                    if client.topics.is_empty() {
                        state.clients.remove(client_id);
                    }
                }
            }

            let deletion = TopicDeletion {
                subscribers_disconnected: subscribers.len(),
                messages_lost: topic.message_count(),
            };
            events.push(BrokerEvent::TopicDeleted {
                topic: name.to_string(),
                subscribers_disconnected: deletion.subscribers_disconnected,
                messages_lost: deletion.messages_lost,
            });
            Some(deletion)
        })
    }

    pub fn get_topic(&self, name: &str) -> Option<TopicSnapshot> {
        self.state().topics.get(name).map(Topic::snapshot)
    }

    /// Snapshots of every topic, ordered by name.
    pub fn list_topics(&self) -> Vec<TopicSnapshot> {
        let mut topics: Vec<_> = self.state().topics.values().map(Topic::snapshot).collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    /// Contents of the topic's ring buffer, oldest first.
    pub fn topic_messages(&self, name: &str) -> Option<Vec<Message>> {
        let state = self.state();
        let topic = state.topics.get(name)?;
        Some(
            topic
                .recent(topic.message_count())
                .map(|m| Message::clone(m))
                .collect(),
        )
    }

    pub fn get_stats(&self) -> BrokerStats {
        let state = self.state();
        BrokerStats {
            topics: state.topics.len(),
            total_subscribers: state.topics.values().map(Topic::subscriber_count).sum(),
            total_messages: state.topics.values().map(Topic::message_count).sum(),
            queue_stats: state
                .clients
                .iter()
                .map(|(id, client)| (id.clone(), client.queue.stats()))
                .collect(),
        }
    }

    /// Pending messages in the client's queue, oldest first.
    pub fn queued_messages(&self, client_id: &str) -> Option<Vec<Message>> {
        let state = self.state();
        let client = state.clients.get(client_id)?;
        Some(
            client
                .queue
                .iter()
                .map(|e| Message::clone(&e.message))
                .collect(),
        )
    }

    pub fn queue_stats(&self, client_id: &str) -> Option<QueueStats> {
        self.state()
            .clients
            .get(client_id)
            .map(|client| client.queue.stats())
    }

    /// Topics the client is subscribed to, sorted.
    pub fn client_topics(&self, client_id: &str) -> Vec<String> {
        let state = self.state();
        let mut topics: Vec<_> = state
            .clients
            .get(client_id)
            .map(|client| client.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Subscribes `client_id` to `topic_name` and replays up to `replay` of
    /// the most recent messages straight to `connection`, bypassing the
    /// queue. Returns the number of messages replayed.
    ///
    /// All subscriptions of one client go through the same connection; a
    /// different connection claiming a subscribed identity is refused.
    pub fn subscribe(
        &self,
        topic_name: &str,
        client_id: &str,
        connection: ConnectionHandle,
        replay: usize,
    ) -> Result<usize> {
        self.with_state(|state, events| -> Result<usize> {
            let topic = state
                .topics
                .get_mut(topic_name)
                .ok_or_else(|| BrokerError::TopicNotFound(topic_name.to_string()))?;
            if topic.is_subscribed(client_id) {
                return Err(BrokerError::AlreadySubscribed {
                    topic: topic_name.to_string(),
                    client_id: client_id.to_string(),
                });
            }

            let client = state
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientState {
                    queue: SubscriberQueue::new(
                        self.settings.max_queue_size,
                        self.settings.backpressure_policy,
                    ),
                    topics: HashSet::new(),
                    connection: connection.clone(),
                });
            if client.connection.id() != connection.id() {
                return Err(BrokerError::IdentityInUse(client_id.to_string()));
            }
            client.topics.insert(topic_name.to_string());
            topic.subscribe(client_id.to_string(), connection.clone());

            let mut replayed = 0;
            let topic_arc: Arc<str> = Arc::from(topic_name);
            for message in topic.recent(replay) {
                let envelope = Envelope {
                    topic: topic_arc.clone(),
                    message: message.clone(),
                };
                let sent = ServerMessage::event(&envelope, true)
                    .to_frame()
                    .map(|frame| connection.send(&frame))
                    .unwrap_or(false);
                if sent {
                    replayed += 1;
                } else {
                    events.push(delivery_failed(client_id, &envelope));
                }
            }

            events.push(BrokerEvent::ClientSubscribed {
                topic: topic_name.to_string(),
                client_id: client_id.to_string(),
                replayed,
            });
            Ok(replayed)
        })
    }

    /// Removes one subscription. `Ok(false)` if the pair was not subscribed.
    /// The client's queue is discarded with its last subscription.
    pub fn unsubscribe(&self, topic_name: &str, client_id: &str) -> Result<bool> {
        self.with_state(|state, events| -> Result<bool> {
            let topic = state
                .topics
                .get_mut(topic_name)
                .ok_or_else(|| BrokerError::TopicNotFound(topic_name.to_string()))?;
            if topic.unsubscribe(client_id).is_none() {
                return Ok(false);
            }

            if let Some(client) = state.clients.get_mut(client_id) {
                client.topics.remove(topic_name);
                client.queue.purge_topic(topic_name);
                if client.topics.is_empty() {
                    state.clients.remove(client_id);
                }
            }

            events.push(BrokerEvent::ClientUnsubscribed {
                topic: topic_name.to_string(),
                client_id: client_id.to_string(),
            });
            Ok(true)
        })
    }

    /// Drops every subscription and the queue of `client_id` in one step.
    /// Returns the topics the client was subscribed to.
    pub fn disconnect_client(&self, client_id: &str) -> Vec<String> {
        self.with_state(|state, events| Self::remove_client(state, client_id, events))
    }

    fn remove_client(
        state: &mut BrokerState,
        client_id: &str,
        events: &mut Vec<BrokerEvent>,
    ) -> Vec<String> {
        let Some(client) = state.clients.remove(client_id) else {
            return Vec::new();
        };

        let mut topics: Vec<String> = client.topics.into_iter().collect();
        topics.sort();
        for name in &topics {
            if let Some(topic) = state.topics.get_mut(name) {
                topic.unsubscribe(client_id);
            }
        }

        events.push(BrokerEvent::ClientDisconnected {
            client_id: client_id.to_string(),
            topics: topics.clone(),
        });
        topics
    }

    /// Appends the message to the topic's ring buffer and fans it out to
    /// every subscriber present at that moment.
    pub fn publish(&self, topic_name: &str, draft: NewMessage) -> Result<PublishReport> {
        self.with_state(|state, events| -> Result<PublishReport> {
            let topic = state
                .topics
                .get_mut(topic_name)
                .ok_or_else(|| BrokerError::TopicNotFound(topic_name.to_string()))?;
            let message = draft.into_message(now_millis())?;
            let envelope = Envelope::new(topic_name, message);
            topic.append(envelope.message.clone());

            let snapshot: Vec<ClientId> = topic.subscribers().map(|(id, _)| id.clone()).collect();
            let mut deliveries = Vec::with_capacity(snapshot.len());
            let mut slow = Vec::new();

            for client_id in snapshot {
                let status = match state.clients.get_mut(&client_id) {
                    None => DeliveryStatus::Failed,
                    Some(client) => match client.queue.add(envelope.clone()) {
                        AddOutcome::Added { evicted } => {
                            if let Some(old) = evicted {
                                events.push(BrokerEvent::MessageDropped {
                                    client_id: client_id.clone(),
                                    topic: old.topic.to_string(),
                                    message_id: old.message.id.clone(),
                                });
                            }
                            match client.flush(&client_id, events) {
                                Flush::Drained => DeliveryStatus::Delivered,
                                Flush::Pending => DeliveryStatus::Queued,
                                Flush::Failed => DeliveryStatus::Failed,
                            }
                        }
                        AddOutcome::Rejected => {
                            slow.push(client_id.clone());
                            DeliveryStatus::SlowConsumer
                        }
                    },
                };
                deliveries.push(Delivery { client_id, status });
            }

            for client_id in &slow {
                Self::evict_slow_consumer(state, client_id, topic_name, events);
            }

            events.push(BrokerEvent::MessagePublished {
                topic: topic_name.to_string(),
                message_id: envelope.message.id.clone(),
                subscribers: deliveries.len(),
            });
            Ok(PublishReport {
                topic: topic_name.to_string(),
                message_id: envelope.message.id.clone(),
                subscribers: deliveries.len(),
                deliveries,
            })
        })
    }

    fn evict_slow_consumer(
        state: &mut BrokerState,
        client_id: &str,
        topic: &str,
        events: &mut Vec<BrokerEvent>,
    ) {
        if let Some(client) = state.clients.get(client_id) {
            let err = BrokerError::SlowConsumer(client_id.to_string());
            if let Ok(frame) = ServerMessage::error(None, &err).to_frame() {
                client.connection.send(&frame);
            }
            client.connection.close(CLOSE_SLOW_CONSUMER, "SLOW_CONSUMER");
        }
        events.push(BrokerEvent::SlowConsumer {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
        });
        Self::remove_client(state, client_id, events);
    }

    /// Retries delivery of one client's queued messages. Returns how many
    /// were sent.
    pub fn flush_client(&self, client_id: &str) -> usize {
        self.with_state(|state, events| {
            let Some(client) = state.clients.get_mut(client_id) else {
                return 0;
            };
            let before = client.queue.len();
            client.flush(client_id, events);
            before - client.queue.len()
        })
    }

    /// Retries delivery for every client with queued messages. Returns how
    /// many messages were sent.
    pub fn flush_pending(&self) -> usize {
        self.with_state(|state, events| {
            let mut sent = 0;
            for (client_id, client) in state.clients.iter_mut() {
                let before = client.queue.len();
                if before == 0 {
                    continue;
                }
                client.flush(client_id, events);
                sent += before - client.queue.len();
            }
            sent
        })
    }

    /// Empties the registry: every topic, subscription and queue is dropped.
    /// Closing connections is left to the connection manager.
    pub fn shutdown(&self) -> ShutdownReport {
        self.with_state(|state, _| {
            let report = ShutdownReport {
                topics: state.topics.len(),
                clients: state.clients.len(),
            };
            state.topics.clear();
            state.clients.clear();
            report
        })
    }
}
