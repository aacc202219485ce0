//! The `error` module defines the error types used within `popqueue`.
//!
//! Logic errors (unknown message ids, acks from the wrong consumer) are not
//! errors here: the broker logs and ignores them. What remains are the cases
//! a caller must react to, plus storage failures, which are fatal for the
//! single publish/ack call that hit them.

use thiserror::Error;

use crate::broker::message::MessageId;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown queue: {queue}")]
    UnknownQueue { queue: String },

    #[error("message {message_id} is not in queue {queue}")]
    UnknownMessage { queue: String, message_id: MessageId },

    #[error("consumer not connected: {consumer_id}")]
    ConsumerNotConnected { consumer_id: String },

    #[error("prefetch limit must be at least 1")]
    InvalidPrefetch,

    #[error("queue name {queue} is reserved for dead-letter queues")]
    ReservedQueueName { queue: String },

    #[error("queue {queue} is full (max depth: {max_depth})")]
    QueueFull { queue: String, max_depth: usize },

    #[error("storage failure: {0}")]
    StorageFailure(#[from] PersistenceError),
}

/// Errors raised by the durable message log.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to (de)serialize stored message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the websocket client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid server message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("server replied with an error: {0}")]
    Server(String),

    #[error("unexpected reply from server: {0}")]
    UnexpectedReply(String),

    #[error("connection closed by server")]
    Closed,
}
