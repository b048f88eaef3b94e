//! The `broker` module is the core of the system: topics, subscriber
//! queues with backpressure, the replay ring buffer and fan-out delivery.

pub mod engine;
pub mod events;
pub mod message;
pub mod queue;
pub mod topic;

pub use engine::{Broker, BrokerStats, Delivery, DeliveryStatus, PublishReport, TopicDeletion};
pub use events::{BrokerEvent, EventSink, TracingEvents};
pub use message::{Message, NewMessage};
pub use queue::{BackpressurePolicy, SubscriberQueue};
pub use topic::{ClientId, TopicSnapshot};
