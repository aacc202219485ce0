//! Wire protocol
//!
//! JSON text frames, tagged by `type`. Message ids travel as plain integers
//! and bodies as UTF-8 strings; non-UTF-8 bodies are converted lossily on
//! the way out.

use serde::{Deserialize, Serialize};

use crate::broker::message::{DeadLetterInfo, Delivery};
use crate::broker::{NackOutcome, QueueStats};

fn default_persistent() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "declare")]
    Declare {
        queue: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        durable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_depth: Option<usize>,
    },
    #[serde(rename = "publish")]
    Publish {
        queue: String,
        body: String,
        #[serde(default = "default_persistent")]
        persistent: bool,
    },
    #[serde(rename = "consume")]
    Consume {
        queue: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefetch: Option<u32>,
    },
    #[serde(rename = "ack")]
    Ack { consumer_id: String, message_id: u64 },
    #[serde(rename = "nack")]
    Nack {
        consumer_id: String,
        message_id: u64,
        #[serde(default)]
        requeue: bool,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { consumer_id: String },
    #[serde(rename = "cancel")]
    Cancel { consumer_id: String },
    #[serde(rename = "stats")]
    Stats { queue: String },
}

/// A delivery as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeliveryFrame {
    pub consumer_id: String,
    pub queue: String,
    pub message_id: u64,
    pub body: String,
    pub delivery_count: u32,
    pub redelivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterInfo>,
}

impl DeliveryFrame {
    pub fn new(consumer_id: &str, delivery: &Delivery) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            queue: delivery.queue.clone(),
            message_id: delivery.message_id.0,
            body: String::from_utf8_lossy(&delivery.body).into_owned(),
            delivery_count: delivery.delivery_count,
            redelivered: delivery.redelivered(),
            dead_letter: delivery.dead_letter.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "declared")]
    Declared { queue: String, recovered: usize },
    #[serde(rename = "published")]
    Published { queue: String, message_id: u64 },
    #[serde(rename = "consume_ok")]
    ConsumeOk { queue: String, consumer_id: String },
    #[serde(rename = "delivery")]
    Delivery(DeliveryFrame),
    #[serde(rename = "acked")]
    Acked {
        consumer_id: String,
        message_id: u64,
        acked: bool,
    },
    #[serde(rename = "nacked")]
    Nacked {
        consumer_id: String,
        message_id: u64,
        outcome: NackOutcome,
    },
    #[serde(rename = "heartbeat_ok")]
    HeartbeatOk { consumer_id: String },
    #[serde(rename = "cancelled")]
    Cancelled {
        consumer_id: String,
        released: Vec<u64>,
    },
    #[serde(rename = "stats")]
    Stats(QueueStats),
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
