//! Message store
//!
//! Holds every queue's messages in memory and mirrors persistent ones into
//! the durable log. Each queue keeps two views of its messages:
//! - `messages`: every message the queue currently owns, whatever its state
//! - `ready`: the dispatch order of the `Ready` subset
//!
//! Persistent messages are written before they become visible and deleted
//! from the log before they disappear from memory, so the log is always a
//! superset of what a consumer could still be told about.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::broker::message::{DeadLetterInfo, Delivery, Message, MessageId, MessageState};
use crate::broker::session::ConsumerId;
use crate::persistence::Persistence;
use crate::utils::error::{BrokerError, Result};

/// Per-queue configuration fixed at declaration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub retry_limit: u32,
    pub max_depth: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            retry_limit: 3,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueKind {
    Work,
    DeadLetter { source: String },
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    pub kind: QueueKind,
    messages: HashMap<MessageId, Message>,
    ready: VecDeque<MessageId>,
}

impl Queue {
    fn new(name: &str, options: QueueOptions, kind: QueueKind) -> Self {
        Self {
            name: name.to_string(),
            options,
            kind,
            messages: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Messages waiting for a consumer.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Messages currently handed out and not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.messages
            .values()
            .filter(|m| matches!(m.state, MessageState::InFlight { .. }))
            .count()
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self.kind, QueueKind::DeadLetter { .. })
    }

    fn push_ready(&mut self, id: MessageId) {
        if !self.ready.contains(&id) {
            self.ready.push_back(id);
        }
    }

    /// Put `id` back where publish order says it belongs: ahead of every
    /// ready message with a larger id.
    fn restore_ready(&mut self, id: MessageId) {
        if self.ready.contains(&id) {
            return;
        }
        let position = self
            .ready
            .iter()
            .position(|&other| other > id)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, id);
    }
}

#[derive(Debug)]
pub struct MessageStore {
    queues: HashMap<String, Queue>,
    persistence: Persistence,
}

impl MessageStore {
    pub fn new(persistence: Persistence) -> Self {
        Self {
            queues: HashMap::new(),
            persistence,
        }
    }

    /// Create `name` if it does not exist yet and replay its durable log.
    /// Returns how many messages were recovered.
    pub fn declare(&mut self, name: &str, options: QueueOptions, kind: QueueKind) -> Result<usize> {
        if let Some(existing) = self.queues.get(name) {
            if existing.options != options || existing.kind != kind {
                warn!(
                    queue = name,
                    "queue already declared with different options, keeping {:?}",
                    existing.options
                );
            }
            return Ok(0);
        }

        let mut queue = Queue::new(name, options, kind);
        if queue.options.durable {
            for stored in self.persistence.read_from(name, 0)? {
                let message = Message::recovered(stored);
                queue.ready.push_back(message.id);
                queue.messages.insert(message.id, message);
            }
        }

        let recovered = queue.messages.len();
        if recovered > 0 {
            info!(queue = name, recovered, "recovered messages from durable log");
        }
        self.queues.insert(name.to_string(), queue);
        Ok(recovered)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn queue(&self, name: &str) -> Result<&Queue> {
        self.queues.get(name).ok_or_else(|| unknown_queue(name))
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    /// Append a new message at the tail of `queue`.
    ///
    /// The message is only persisted when both the queue is durable and the
    /// producer asked for persistence.
    pub fn append(&mut self, queue: &str, body: Vec<u8>, persistent: bool) -> Result<MessageId> {
        let q = self.queue(queue)?;
        if let Some(max_depth) = q.options.max_depth {
            if q.ready_len() >= max_depth {
                return Err(BrokerError::QueueFull {
                    queue: queue.to_string(),
                    max_depth,
                });
            }
        }
        let persistent = persistent && q.options.durable;

        let id = MessageId(self.persistence.next_id()?);
        self.enqueue(queue, Message::new(id, body, persistent))
    }

    /// Append a dead-lettered copy. Depth limits do not apply: refusing it
    /// would mean losing the message.
    pub(crate) fn append_dead_lettered(
        &mut self,
        queue: &str,
        body: Vec<u8>,
        persistent: bool,
        info: DeadLetterInfo,
    ) -> Result<MessageId> {
        let persistent = persistent && self.queue(queue)?.options.durable;
        let id = MessageId(self.persistence.next_id()?);
        let mut message = Message::new(id, body, persistent);
        message.dead_letter = Some(info);
        self.enqueue(queue, message)
    }

    fn enqueue(&mut self, queue: &str, message: Message) -> Result<MessageId> {
        if message.persistent {
            self.persistence.append(queue, &message.to_stored())?;
        }
        let q = self.queue_mut(queue)?;
        let id = message.id;
        q.messages.insert(id, message);
        q.ready.push_back(id);
        debug!(queue, %id, "message appended");
        Ok(id)
    }

    /// The oldest ready message, without taking it.
    pub fn peek(&self, queue: &str) -> Result<Option<&Message>> {
        let q = self.queue(queue)?;
        Ok(q.ready.front().and_then(|id| q.messages.get(id)))
    }

    pub fn get(&self, queue: &str, id: MessageId) -> Option<&Message> {
        self.queues.get(queue).and_then(|q| q.messages.get(&id))
    }

    /// Delete a message for good. The durable record goes first.
    pub fn remove(&mut self, queue: &str, id: MessageId) -> Result<Message> {
        let persistent = self
            .get(queue, id)
            .map(|m| m.persistent)
            .ok_or_else(|| unknown_message(queue, id))?;
        if persistent {
            self.persistence.mark_deleted(queue, id.0)?;
        }

        let q = self.queue_mut(queue)?;
        q.ready.retain(|&other| other != id);
        q.messages
            .remove(&id)
            .ok_or_else(|| unknown_message(queue, id))
    }

    /// Return a message to the tail of the ready set.
    ///
    /// Tail placement means a message that keeps failing cannot starve the
    /// rest of the queue while it is being retried.
    pub fn requeue(&mut self, queue: &str, id: MessageId) -> Result<()> {
        let q = self.queue_mut(queue)?;
        let message = q
            .messages
            .get_mut(&id)
            .ok_or_else(|| unknown_message(queue, id))?;
        message.state = MessageState::Ready;
        q.push_ready(id);
        Ok(())
    }

    /// Return a message to its original position in the ready set.
    pub(crate) fn restore(&mut self, queue: &str, id: MessageId) -> Result<()> {
        let q = self.queue_mut(queue)?;
        let message = q
            .messages
            .get_mut(&id)
            .ok_or_else(|| unknown_message(queue, id))?;
        message.state = MessageState::Ready;
        q.restore_ready(id);
        Ok(())
    }

    pub(crate) fn pop_ready(&mut self, queue: &str) -> Option<MessageId> {
        self.queues.get_mut(queue).and_then(|q| q.ready.pop_front())
    }

    /// Flip a popped message to `InFlight` for `consumer`, bump its delivery
    /// count and build what the consumer will see.
    pub(crate) fn record_delivery(
        &mut self,
        queue: &str,
        id: MessageId,
        consumer: &ConsumerId,
    ) -> Result<Delivery> {
        let Self {
            queues,
            persistence,
        } = self;
        let message = queues
            .get_mut(queue)
            .and_then(|q| q.messages.get_mut(&id))
            .ok_or_else(|| unknown_message(queue, id))?;

        message.delivery_count = message.delivery_count.saturating_add(1);
        message.state = MessageState::InFlight {
            consumer: consumer.clone(),
        };

        if message.persistent {
            if let Err(e) = persistence.update(queue, &message.to_stored()) {
                // the delivery still happens, a restart just sees an older count
                warn!(queue, %id, "failed to persist delivery count: {e}");
            }
        }

        Ok(Delivery::from_message(queue, message))
    }

    /// Reverse `record_delivery` for a message that never reached its consumer.
    pub(crate) fn undo_delivery(&mut self, queue: &str, id: MessageId) {
        let Self {
            queues,
            persistence,
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        let Some(message) = q.messages.get_mut(&id) else {
            return;
        };

        message.delivery_count = message.delivery_count.saturating_sub(1);
        message.state = MessageState::Ready;
        if message.persistent {
            if let Err(e) = persistence.update(queue, &message.to_stored()) {
                warn!(queue, %id, "failed to persist restored delivery count: {e}");
            }
        }
        q.ready.push_front(id);
    }

    /// Ids of the ready set, in dispatch order.
    pub fn ready_ids(&self, queue: &str) -> Result<Vec<MessageId>> {
        Ok(self.queue(queue)?.ready.iter().copied().collect())
    }

    pub(crate) fn set_in_flight(&mut self, queue: &str, id: MessageId, consumer: ConsumerId) {
        if let Some(message) = self
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.get_mut(&id))
        {
            message.state = MessageState::InFlight { consumer };
        }
    }

    pub(crate) fn mark_dead_lettered(&mut self, queue: &str, id: MessageId) {
        if let Some(message) = self
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.get_mut(&id))
        {
            message.state = MessageState::DeadLettered;
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut Queue> {
        self.queues.get_mut(name).ok_or_else(|| unknown_queue(name))
    }
}

fn unknown_queue(name: &str) -> BrokerError {
    BrokerError::UnknownQueue {
        queue: name.to_string(),
    }
}

fn unknown_message(queue: &str, id: MessageId) -> BrokerError {
    BrokerError::UnknownMessage {
        queue: queue.to_string(),
        message_id: id,
    }
}
