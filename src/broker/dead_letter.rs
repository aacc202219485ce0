//! Dead-letter routing
//!
//! Every work queue `name` has a companion queue `name.dlq` in the same
//! store. Routing copies the body into it as a brand new `Ready` message
//! (fresh id, `delivery_count = 0`, provenance in `DeadLetterInfo`) and only
//! then deletes the original, so a crash between the two steps leaves a
//! duplicate rather than a hole. Nothing ever moves a message back: the
//! dead-letter queue is drained by whoever explicitly consumes from it.

use tracing::{error, warn};

use crate::broker::message::{DeadLetterInfo, DeadLetterReason, MessageId, MessageState};
use crate::broker::store::{MessageStore, QueueKind, QueueOptions};
use crate::utils::error::{BrokerError, Result};

pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

#[derive(Debug, Default)]
pub struct DeadLetterRouter;

impl DeadLetterRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn dead_letter_queue_name(original_queue: &str) -> String {
        format!("{original_queue}{DEAD_LETTER_SUFFIX}")
    }

    /// Declare the dead-letter companion of `original_queue`. It shares the
    /// original's durability and is never depth-limited.
    pub fn declare_for(
        &self,
        store: &mut MessageStore,
        original_queue: &str,
        options: &QueueOptions,
    ) -> Result<usize> {
        let name = Self::dead_letter_queue_name(original_queue);
        let dlq_options = QueueOptions {
            durable: options.durable,
            retry_limit: options.retry_limit,
            max_depth: None,
        };
        store.declare(
            &name,
            dlq_options,
            QueueKind::DeadLetter {
                source: original_queue.to_string(),
            },
        )
    }

    /// Move `message_id` out of `original_queue` into its dead-letter queue
    /// and return the dead-letter queue's name.
    pub fn route(
        &self,
        store: &mut MessageStore,
        original_queue: &str,
        message_id: MessageId,
        reason: DeadLetterReason,
    ) -> Result<String> {
        let dead_letter_queue = Self::dead_letter_queue_name(original_queue);
        let (body, persistent, attempts, previous_state) = store
            .get(original_queue, message_id)
            .map(|m| (m.body.clone(), m.persistent, m.delivery_count, m.state.clone()))
            .ok_or_else(|| BrokerError::UnknownMessage {
                queue: original_queue.to_string(),
                message_id,
            })?;

        let info = DeadLetterInfo {
            original_queue: original_queue.to_string(),
            original_id: message_id.0,
            reason,
            attempts,
            dead_lettered_at: chrono::Utc::now().timestamp_millis(),
        };
        let copy = store.append_dead_lettered(&dead_letter_queue, body, persistent, info)?;

        store.mark_dead_lettered(original_queue, message_id);
        if let Err(e) = store.remove(original_queue, message_id) {
            error!(
                queue = original_queue,
                %message_id,
                "dead-lettered copy {copy} written but original could not be removed: {e}"
            );
            restore_state(store, original_queue, message_id, previous_state);
            return Err(e);
        }

        warn!(
            queue = original_queue,
            %message_id,
            dead_letter_queue = %dead_letter_queue,
            ?reason,
            attempts,
            "message dead-lettered"
        );
        Ok(dead_letter_queue)
    }
}

fn restore_state(
    store: &mut MessageStore,
    queue: &str,
    message_id: MessageId,
    state: MessageState,
) {
    match state {
        MessageState::Ready => {
            if let Err(e) = store.requeue(queue, message_id) {
                warn!(queue, %message_id, "could not return message to the ready set: {e}");
            }
        }
        MessageState::InFlight { consumer } => store.set_in_flight(queue, message_id, consumer),
        MessageState::DeadLettered => {}
    }
}
