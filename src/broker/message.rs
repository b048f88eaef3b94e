//! Message definitions for the broker
//!
//! `Message` is the stored, immutable representation of a published message.
//! Notes on fields:
//! - `id`: caller-supplied; the broker does not enforce uniqueness within a topic
//! - `payload`: opaque JSON value, never inspected by the broker
//! - `timestamp`: milliseconds since UNIX epoch; assigned by the broker when absent
//!
//! `NewMessage` is what a publisher hands in. Every field is optional so the
//! broker, not the decoder, decides what makes a message invalid.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl NewMessage {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            payload: Some(payload),
            timestamp: None,
        }
    }

    /// Validates the draft and stamps it with `now` if it carries no timestamp.
    pub fn into_message(self, now: i64) -> Result<Message> {
        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(BrokerError::InvalidMessage("message.id is required".into())),
        };
        let payload = match self.payload {
            Some(Value::Null) | None => {
                return Err(BrokerError::InvalidMessage(
                    "message.payload is required".into(),
                ));
            }
            Some(payload) => payload,
        };

        Ok(Message {
            id,
            payload,
            timestamp: self.timestamp.unwrap_or(now),
        })
    }
}

/// A message bound to the topic it was published on; the unit held in
/// subscriber queues.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Arc<str>,
    pub message: Arc<Message>,
}

impl Envelope {
    pub fn new(topic: &str, message: Message) -> Self {
        Self {
            topic: Arc::from(topic),
            message: Arc::new(message),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
