//! Wire protocol
//!
//! One JSON object per WebSocket text frame. Inbound frames are decoded
//! leniently into `ClientMessage` (every field optional) and then checked
//! structurally into a `Request`, so a missing field yields a `BAD_REQUEST`
//! reply instead of an undecodable frame. Outbound frames are `ServerMessage`s
//! tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::{Envelope, Message, NewMessage, now_millis};
use crate::utils::error::{BrokerError, ErrorCode, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<NewMessage>,
    #[serde(default)]
    pub last_n: Option<usize>,
    #[serde(default)]
    pub request_id: Option<Value>,
}

/// A structurally valid inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Subscribe {
        topic: String,
        client_id: String,
        last_n: usize,
    },
    Unsubscribe {
        topic: String,
        client_id: String,
    },
    Publish {
        topic: String,
        client_id: String,
        message: NewMessage,
    },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BrokerError::BadRequest(format!("malformed frame: {e}")))
    }

    /// Checks the fields required by the message type. `bound` is the
    /// identity already bound to the connection; it takes precedence over
    /// whatever `client_id` this frame carries.
    pub fn into_request(self, bound: Option<&str>) -> Result<Request> {
        let kind = self
            .kind
            .ok_or_else(|| BrokerError::BadRequest("type is required".into()))?;

        if kind == "ping" {
            return Ok(Request::Ping);
        }
        if !matches!(kind.as_str(), "subscribe" | "unsubscribe" | "publish") {
            return Err(BrokerError::BadRequest(format!(
                "unknown message type '{kind}'"
            )));
        }

        let topic = match self.topic {
            Some(topic) if !topic.is_empty() => topic,
            _ => return Err(BrokerError::BadRequest("topic is required".into())),
        };
        let client_id = match bound.map(str::to_owned).or(self.client_id) {
            Some(id) if !id.is_empty() => id,
            _ => return Err(BrokerError::BadRequest("client_id is required".into())),
        };

        match kind.as_str() {
            "subscribe" => Ok(Request::Subscribe {
                topic,
                client_id,
                last_n: self.last_n.unwrap_or(0),
            }),
            "unsubscribe" => Ok(Request::Unsubscribe { topic, client_id }),
            _ => {
                let message = self
                    .message
                    .ok_or_else(|| BrokerError::BadRequest("message is required".into()))?;
                Ok(Request::Publish {
                    topic,
                    client_id,
                    message,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Subscribed,
    Unsubscribed,
    Published,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        topic: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscribers: Option<usize>,
        ts: i64,
    },
    Event {
        topic: String,
        message: Message,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        replay: bool,
        ts: i64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        error: ErrorCode,
        message: String,
        ts: i64,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        ts: i64,
    },
    Info {
        msg: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        ts: i64,
    },
}

impl ServerMessage {
    pub fn ack(
        request_id: Option<Value>,
        topic: &str,
        status: AckStatus,
        subscribers: Option<usize>,
    ) -> Self {
        ServerMessage::Ack {
            request_id,
            topic: topic.to_string(),
            status,
            subscribers,
            ts: now_millis(),
        }
    }

    pub fn event(envelope: &Envelope, replay: bool) -> Self {
        ServerMessage::Event {
            topic: envelope.topic.to_string(),
            message: Message::clone(&envelope.message),
            replay,
            ts: now_millis(),
        }
    }

    pub fn error(request_id: Option<Value>, err: &BrokerError) -> Self {
        ServerMessage::Error {
            request_id,
            error: err.code(),
            message: err.client_message(),
            ts: now_millis(),
        }
    }

    pub fn pong(request_id: Option<Value>) -> Self {
        ServerMessage::Pong {
            request_id,
            ts: now_millis(),
        }
    }

    pub fn info(msg: &str, connection_id: Option<String>) -> Self {
        ServerMessage::Info {
            msg: msg.to_string(),
            connection_id,
            ts: now_millis(),
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
