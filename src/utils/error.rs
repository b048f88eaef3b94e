//! The `error` module defines the error types used within the `fanbus` broker.
//!
//! Every fallible broker or protocol operation returns [`BrokerError`]. Each
//! variant maps onto one of the wire-level [`ErrorCode`]s that are reported to
//! clients in `error` frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried in the `error` field of outbound `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    TopicNotFound,
    TopicExists,
    AlreadySubscribed,
    InvalidMessage,
    SlowConsumer,
    Internal,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("topic '{0}' already exists")]
    TopicExists(String),

    #[error("client '{client_id}' is already subscribed to '{topic}'")]
    AlreadySubscribed { topic: String, client_id: String },

    #[error("client '{client_id}' is not subscribed to '{topic}'")]
    NotSubscribed { topic: String, client_id: String },

    #[error("client '{0}' is bound to another connection")]
    IdentityInUse(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("client '{0}' is not draining its queue")]
    SlowConsumer(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The wire code reported to the client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::BadRequest(_) | BrokerError::IdentityInUse(_) => ErrorCode::BadRequest,
            BrokerError::TopicNotFound(_) | BrokerError::NotSubscribed { .. } => {
                ErrorCode::TopicNotFound
            }
            BrokerError::TopicExists(_) => ErrorCode::TopicExists,
            BrokerError::AlreadySubscribed { .. } => ErrorCode::AlreadySubscribed,
            BrokerError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            BrokerError::SlowConsumer(_) => ErrorCode::SlowConsumer,
            BrokerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Text sent to the client. Internal details never leave the process.
    pub fn client_message(&self) -> String {
        match self {
            BrokerError::Internal(_) => "internal server error".to_string(),
            BrokerError::NotSubscribed { .. } => "not subscribed to topic".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Internal(format!("serialization failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
