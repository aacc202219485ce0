//! Acknowledgment handling
//!
//! Settles in-flight messages. Ownership is checked first and released last:
//! if a storage write fails half-way the message is still in flight for the
//! same consumer, and the consumer can simply try again.
//!
//! Outcomes:
//! - ack: the message is deleted (durable record first)
//! - nack with requeue, budget left: back to the tail of the ready set
//! - nack without requeue, or `delivery_count > retry_limit`: dead-lettered.
//!   Exhaustion wins over the caller's requeue flag
//!
//! Acks and nacks for messages the consumer does not hold are logged and
//! ignored; they never fail the call.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::engine::{Broker, now_ms};
use crate::broker::message::{DeadLetterReason, MessageId};
use crate::broker::session::ConsumerId;
use crate::utils::error::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NackOutcome {
    /// The consumer did not hold the message; nothing changed.
    Ignored,
    /// Back in the ready set of its queue.
    Requeued,
    DeadLettered {
        dead_letter_queue: String,
        reason: DeadLetterReason,
    },
}

impl Broker {
    /// Acknowledge successful processing. Returns `true` exactly once per
    /// delivered message; later or foreign acks return `false`.
    pub fn ack(&mut self, consumer: &ConsumerId, message_id: MessageId) -> Result<bool> {
        let queue = self.active_queue_of(consumer)?;

        if !self.tracker.is_owner(consumer, message_id) {
            warn!(
                consumer = %consumer,
                %message_id,
                "ignoring ack for a message the consumer does not hold"
            );
            return Ok(false);
        }

        self.store.remove(&queue, message_id)?;
        self.tracker.mark_acked(consumer, message_id);
        debug!(queue = %queue, consumer = %consumer, %message_id, "message acked");

        self.dispatch(&queue);
        Ok(true)
    }

    /// Report failed processing.
    pub fn nack(
        &mut self,
        consumer: &ConsumerId,
        message_id: MessageId,
        requeue: bool,
    ) -> Result<NackOutcome> {
        let queue = self.active_queue_of(consumer)?;

        if !self.tracker.is_owner(consumer, message_id) {
            warn!(
                consumer = %consumer,
                %message_id,
                "ignoring nack for a message the consumer does not hold"
            );
            return Ok(NackOutcome::Ignored);
        }

        let delivery_count = self
            .store
            .get(&queue, message_id)
            .map(|m| m.delivery_count)
            .ok_or_else(|| BrokerError::UnknownMessage {
                queue: queue.clone(),
                message_id,
            })?;
        let q = self.store.queue(&queue)?;
        let exhausted = delivery_count > q.options.retry_limit;

        let outcome = if q.is_dead_letter() {
            if !requeue {
                warn!(queue = %queue, %message_id, "dead-letter queues do not dead-letter, requeueing");
            }
            self.store.requeue(&queue, message_id)?;
            NackOutcome::Requeued
        } else if requeue && !exhausted {
            self.store.requeue(&queue, message_id)?;
            NackOutcome::Requeued
        } else {
            let reason = if exhausted {
                DeadLetterReason::RetryBudgetExhausted
            } else {
                DeadLetterReason::Rejected
            };
            let dead_letter_queue =
                self.dead_letters
                    .route(&mut self.store, &queue, message_id, reason)?;
            NackOutcome::DeadLettered {
                dead_letter_queue,
                reason,
            }
        };

        self.tracker.mark_acked(consumer, message_id);
        debug!(queue = %queue, consumer = %consumer, %message_id, ?outcome, "message nacked");

        self.redispatch(&queue);
        Ok(outcome)
    }

    /// Queue of a connected consumer. Also counts as a sign of life.
    pub(crate) fn active_queue_of(&mut self, consumer: &ConsumerId) -> Result<String> {
        let queue = self
            .sessions
            .get(consumer)
            .map(|s| s.queue_name.clone())
            .ok_or_else(|| BrokerError::ConsumerNotConnected {
                consumer_id: consumer.clone(),
            })?;
        self.sessions.touch(consumer, now_ms());
        Ok(queue)
    }
}
