//! Message definitions for the broker
//!
//! `Message` is the broker-owned record of one unit of work. The payload is
//! opaque bytes; everything else is delivery metadata that only the broker
//! mutates. In particular `delivery_count` is not something a producer or a
//! consumer can set: it is bumped by the dispatcher and read back through
//! `Delivery`.
//!
//! Lifecycle, driven by `MessageState`:
//! - `Ready`: eligible for dispatch
//! - `InFlight`: handed to exactly one consumer, awaiting ack/nack
//! - `DeadLettered`: terminal in the original queue, a fresh copy lives on in
//!   the dead-letter queue

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::broker::session::ConsumerId;
use crate::persistence::StoredMessage;

/// Opaque message id. Ids grow with publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageState {
    Ready,
    InFlight { consumer: ConsumerId },
    DeadLettered,
}

/// Why a message ended up in a dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The consumer nacked it with `requeue = false`.
    Rejected,
    /// `delivery_count` went past the queue's retry limit.
    RetryBudgetExhausted,
}

/// Provenance kept on a dead-lettered copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterInfo {
    pub original_queue: String,
    pub original_id: u64,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub dead_lettered_at: i64,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) id: MessageId,
    pub(crate) body: Vec<u8>,
    pub(crate) persistent: bool,
    pub(crate) delivery_count: u32,
    pub(crate) state: MessageState,
    pub(crate) enqueued_at: i64,
    pub(crate) dead_letter: Option<DeadLetterInfo>,
}

impl Message {
    pub(crate) fn new(id: MessageId, body: Vec<u8>, persistent: bool) -> Self {
        Self {
            id,
            body,
            persistent,
            delivery_count: 0,
            state: MessageState::Ready,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            dead_letter: None,
        }
    }

    /// Rebuild a message from the durable log. Whatever state it was in
    /// before the restart, it comes back `Ready`.
    pub(crate) fn recovered(stored: StoredMessage) -> Self {
        Self {
            id: MessageId(stored.id),
            body: stored.body,
            persistent: true,
            delivery_count: stored.delivery_count,
            state: MessageState::Ready,
            enqueued_at: stored.enqueued_at,
            dead_letter: stored.dead_letter,
        }
    }

    pub(crate) fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            id: self.id.0,
            body: self.body.clone(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
            dead_letter: self.dead_letter.clone(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn state(&self) -> &MessageState {
        &self.state
    }

    /// Set only while the message is in flight.
    pub fn owner(&self) -> Option<&ConsumerId> {
        match &self.state {
            MessageState::InFlight { consumer } => Some(consumer),
            _ => None,
        }
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterInfo> {
        self.dead_letter.as_ref()
    }
}

/// What a consumer receives: a copy of the payload plus read-only metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    pub message_id: MessageId,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    pub dead_letter: Option<DeadLetterInfo>,
}

impl Delivery {
    pub(crate) fn from_message(queue: &str, message: &Message) -> Self {
        Self {
            queue: queue.to_string(),
            message_id: message.id,
            body: message.body.clone(),
            delivery_count: message.delivery_count,
            dead_letter: message.dead_letter.clone(),
        }
    }

    /// True when this is not the first time the message is handed out.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}
