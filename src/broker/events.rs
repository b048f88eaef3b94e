//! Broker lifecycle events
//!
//! The engine reports what happens to topics, subscriptions and messages as
//! `BrokerEvent`s handed to an `EventSink`. Logging and metrics hang off the
//! sink; the engine itself never formats log lines for these facts.

use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    TopicCreated {
        topic: String,
    },
    TopicDeleted {
        topic: String,
        subscribers_disconnected: usize,
        messages_lost: usize,
    },
    ClientSubscribed {
        topic: String,
        client_id: String,
        replayed: usize,
    },
    ClientUnsubscribed {
        topic: String,
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
        topics: Vec<String>,
    },
    MessagePublished {
        topic: String,
        message_id: String,
        subscribers: usize,
    },
    MessageDropped {
        client_id: String,
        topic: String,
        message_id: String,
    },
    DeliveryFailed {
        client_id: String,
        topic: String,
        message_id: String,
    },
    SlowConsumer {
        client_id: String,
        topic: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BrokerEvent);
}

/// Default sink: every event becomes a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn emit(&self, event: &BrokerEvent) {
        match event {
            BrokerEvent::TopicCreated { topic } => info!(%topic, "topic created"),
            BrokerEvent::TopicDeleted {
                topic,
                subscribers_disconnected,
                messages_lost,
            } => info!(
                %topic,
                subscribers_disconnected,
                messages_lost,
                "topic deleted"
            ),
            BrokerEvent::ClientSubscribed {
                topic,
                client_id,
                replayed,
            } => info!(%topic, %client_id, replayed, "client subscribed"),
            BrokerEvent::ClientUnsubscribed { topic, client_id } => {
                info!(%topic, %client_id, "client unsubscribed")
            }
            BrokerEvent::ClientDisconnected { client_id, topics } => {
                info!(%client_id, topics = topics.len(), "client disconnected")
            }
            BrokerEvent::MessagePublished {
                topic,
                message_id,
                subscribers,
            } => debug!(%topic, %message_id, subscribers, "message published"),
            BrokerEvent::MessageDropped {
                client_id,
                topic,
                message_id,
            } => warn!(%client_id, %topic, %message_id, "queue full, oldest message dropped"),
            BrokerEvent::DeliveryFailed {
                client_id,
                topic,
                message_id,
            } => warn!(%client_id, %topic, %message_id, "delivery failed"),
            BrokerEvent::SlowConsumer { client_id, topic } => {
                warn!(%client_id, %topic, "slow consumer disconnected")
            }
        }
    }
}
