//! Delivery tracker
//!
//! Remembers which consumer holds which in-flight message. Two maps are kept
//! in step: the per-consumer sets answer "what does this consumer hold" (for
//! credit and bulk release), and `owners` answers "who holds this message",
//! which is what keeps the per-consumer sets disjoint.

use std::collections::{BTreeSet, HashMap};

use crate::broker::message::MessageId;
use crate::broker::session::ConsumerId;

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    in_flight: HashMap<ConsumerId, BTreeSet<MessageId>>,
    owners: HashMap<MessageId, ConsumerId>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `consumer` now holds `message_id`. Refuses (returns
    /// `false`) if another consumer already holds it.
    pub fn mark_in_flight(&mut self, consumer: &ConsumerId, message_id: MessageId) -> bool {
        match self.owners.get(&message_id) {
            Some(owner) => owner == consumer,
            None => {
                self.owners.insert(message_id, consumer.clone());
                self.in_flight
                    .entry(consumer.clone())
                    .or_default()
                    .insert(message_id);
                true
            }
        }
    }

    /// Drop `consumer`'s hold on `message_id`. Returns `false` when the
    /// consumer does not hold it, which covers both a second ack and an ack
    /// for a message that went to somebody else.
    pub fn mark_acked(&mut self, consumer: &ConsumerId, message_id: MessageId) -> bool {
        if !self.is_owner(consumer, message_id) {
            return false;
        }
        self.owners.remove(&message_id);
        if let Some(held) = self.in_flight.get_mut(consumer) {
            held.remove(&message_id);
            if held.is_empty() {
                self.in_flight.remove(consumer);
            }
        }
        true
    }

    /// Release everything `consumer` holds, oldest id first. Calling it again
    /// for the same consumer releases nothing.
    pub fn release_all(&mut self, consumer: &ConsumerId) -> Vec<MessageId> {
        let released: Vec<MessageId> = self
            .in_flight
            .remove(consumer)
            .map(|held| held.into_iter().collect())
            .unwrap_or_default();
        for id in &released {
            self.owners.remove(id);
        }
        released
    }

    pub fn is_owner(&self, consumer: &ConsumerId, message_id: MessageId) -> bool {
        self.owners.get(&message_id) == Some(consumer)
    }

    pub fn owner(&self, message_id: MessageId) -> Option<&ConsumerId> {
        self.owners.get(&message_id)
    }

    pub fn in_flight_count(&self, consumer: &ConsumerId) -> usize {
        self.in_flight.get(consumer).map_or(0, BTreeSet::len)
    }

    pub fn in_flight_ids(&self, consumer: &ConsumerId) -> Vec<MessageId> {
        self.in_flight
            .get(consumer)
            .map(|held| held.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total number of in-flight messages across all consumers.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
