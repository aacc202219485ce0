//! Dispatcher
//!
//! Moves messages from `Ready` to `InFlight`. A pass over a queue repeats
//! two choices until one of them comes up empty:
//! - the consumer: the next session, in connection order, that still has
//!   credit (`in flight < prefetch_limit`). The walk starts just after the
//!   session served last, so consumers take turns
//! - the message: the head of the queue's ready set
//!
//! The dispatcher never waits. The broker runs a pass whenever something may
//! have changed the answer (publish, ack, nack, connect, disconnect); a
//! consumer with nothing to do simply awaits its delivery channel.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, warn};

use crate::broker::session::{ConsumerId, ConsumerSession, SessionManager};
use crate::broker::store::MessageStore;
use crate::broker::tracker::DeliveryTracker;

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub delivered: usize,
    /// Sessions whose delivery channel turned out to be closed. The broker
    /// disconnects them.
    pub dead_consumers: Vec<ConsumerId>,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    /// Connection sequence of the session served last, per queue.
    last_served: HashMap<String, u64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(
        &mut self,
        queue: &str,
        store: &mut MessageStore,
        tracker: &mut DeliveryTracker,
        sessions: &SessionManager,
    ) -> DispatchOutcome {
        let consumers = sessions.for_queue(queue);
        let mut outcome = DispatchOutcome::default();
        if consumers.is_empty() {
            return outcome;
        }

        let mut dead: HashSet<ConsumerId> = HashSet::new();
        loop {
            let Some(session) = self.next_consumer(queue, &consumers, tracker, &dead) else {
                break;
            };
            let Some(message_id) = store.pop_ready(queue) else {
                break;
            };

            if !tracker.mark_in_flight(&session.id, message_id) {
                error!(
                    queue,
                    %message_id,
                    owner = ?tracker.owner(message_id),
                    "ready message is already in flight, skipping"
                );
                continue;
            }

            let delivery = match store.record_delivery(queue, message_id, &session.id) {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!(queue, %message_id, "cannot deliver message: {e}");
                    tracker.mark_acked(&session.id, message_id);
                    continue;
                }
            };
            let delivery_count = delivery.delivery_count;

            match session.deliver(delivery) {
                Ok(()) => {
                    outcome.delivered += 1;
                    self.last_served
                        .insert(queue.to_string(), session.connected_seq);
                    debug!(
                        queue,
                        %message_id,
                        consumer = %session.id,
                        delivery_count,
                        "dispatched message"
                    );
                }
                Err(_) => {
                    debug!(consumer = %session.id, "delivery channel closed");
                    tracker.mark_acked(&session.id, message_id);
                    store.undo_delivery(queue, message_id);
                    dead.insert(session.id.clone());
                }
            }
        }

        outcome.dead_consumers = dead.into_iter().collect();
        outcome
    }

    /// First session with credit, walking in connection order starting right
    /// after the one served last and wrapping around.
    fn next_consumer<'a>(
        &self,
        queue: &str,
        consumers: &[&'a ConsumerSession],
        tracker: &DeliveryTracker,
        dead: &HashSet<ConsumerId>,
    ) -> Option<&'a ConsumerSession> {
        let last = self.last_served.get(queue).copied();
        let has_credit = |session: &&ConsumerSession| {
            !dead.contains(&session.id)
                && tracker.in_flight_count(&session.id) < session.prefetch_limit as usize
        };

        let after = consumers
            .iter()
            .filter(|s| last.is_none_or(|l| s.connected_seq > l));
        let up_to = consumers
            .iter()
            .filter(|s| last.is_some_and(|l| s.connected_seq <= l));

        after.chain(up_to).find(|s| has_credit(*s)).copied()
    }
}
