//! Consumer sessions
//!
//! A `ConsumerSession` is one connected worker pulling from one queue. It
//! owns the sending half of the channel deliveries are pushed into; the
//! worker (in-process consumer or websocket connection) holds the receiver.
//!
//! Sessions are ordered by connection sequence. The dispatcher walks them in
//! that order, which is what makes older sessions win ties.
//!
//! Liveness is tracked as the timestamp of the last heartbeat (or any other
//! protocol activity). The reaper compares it against the session timeout
//! and hands expired sessions back to the broker, which disconnects them
//! exactly as if the consumer had closed gracefully.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::engine::{Broker, SharedBroker, lock_broker, now_ms};
use crate::broker::message::{DeadLetterReason, Delivery, MessageId};
use crate::utils::error::{BrokerError, Result};

pub type ConsumerId = String;

#[derive(Debug)]
pub struct ConsumerSession {
    pub id: ConsumerId,
    pub queue_name: String,
    pub prefetch_limit: u32,
    pub connected: bool,
    pub(crate) connected_seq: u64,
    pub(crate) last_heartbeat_ms: i64,
    sender: UnboundedSender<Delivery>,
}

impl ConsumerSession {
    /// Push a delivery to the worker. Hands the delivery back when the
    /// receiving side is gone.
    pub(crate) fn deliver(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        self.sender.send(delivery).map_err(|e| e.0)
    }

    pub fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) > timeout_ms
    }
}

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<ConsumerId, ConsumerSession>,
    next_seq: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session on `queue_name`. The caller is expected to have
    /// validated the queue and the prefetch limit.
    pub fn open(
        &mut self,
        queue_name: &str,
        prefetch_limit: u32,
        now_ms: i64,
    ) -> (ConsumerId, UnboundedReceiver<Delivery>) {
        let (sender, receiver) = unbounded_channel();
        let id = Uuid::new_v4().to_string();
        let session = ConsumerSession {
            id: id.clone(),
            queue_name: queue_name.to_string(),
            prefetch_limit,
            connected: true,
            connected_seq: self.next_seq,
            last_heartbeat_ms: now_ms,
            sender,
        };
        self.next_seq += 1;
        self.sessions.insert(id.clone(), session);
        (id, receiver)
    }

    /// Destroy a session. Returns it so the caller can release its messages.
    pub fn close(&mut self, id: &ConsumerId) -> Option<ConsumerSession> {
        self.sessions.remove(id).map(|mut session| {
            session.connected = false;
            session
        })
    }

    pub fn get(&self, id: &ConsumerId) -> Option<&ConsumerSession> {
        self.sessions.get(id)
    }

    /// Refresh liveness. Returns `false` for an unknown session.
    pub fn touch(&mut self, id: &ConsumerId, now_ms: i64) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.last_heartbeat_ms = session.last_heartbeat_ms.max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Sessions consuming from `queue_name`, oldest connection first.
    pub fn for_queue(&self, queue_name: &str) -> Vec<&ConsumerSession> {
        let mut sessions: Vec<&ConsumerSession> = self
            .sessions
            .values()
            .filter(|s| s.connected && s.queue_name == queue_name)
            .collect();
        sessions.sort_by_key(|s| s.connected_seq);
        sessions
    }

    /// Ids of sessions that have not been heard from within `timeout_ms`.
    pub fn expired(&self, now_ms: i64, timeout_ms: i64) -> Vec<ConsumerId> {
        let mut expired: Vec<&ConsumerSession> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now_ms, timeout_ms))
            .collect();
        expired.sort_by_key(|s| s.connected_seq);
        expired.into_iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Broker {
    /// Open a consumer session on `queue`. Deliveries arrive on the returned
    /// receiver; anything already ready is dispatched right away.
    pub fn connect(
        &mut self,
        queue: &str,
        prefetch_limit: u32,
    ) -> Result<(ConsumerId, UnboundedReceiver<Delivery>)> {
        if prefetch_limit == 0 {
            return Err(BrokerError::InvalidPrefetch);
        }
        self.store.queue(queue)?;

        let (id, receiver) = self.sessions.open(queue, prefetch_limit, now_ms());
        info!(consumer = %id, queue, prefetch_limit, "consumer connected");

        self.dispatch(queue);
        Ok((id, receiver))
    }

    /// Close a session and put everything it held back in its queue.
    /// Returns the released message ids; an unknown consumer releases nothing.
    pub fn disconnect(&mut self, consumer: &ConsumerId) -> Vec<MessageId> {
        match self.drop_session(consumer) {
            Some((queue, released)) => {
                self.redispatch(&queue);
                released
            }
            None => {
                debug!(consumer = %consumer, "disconnect for unknown consumer");
                Vec::new()
            }
        }
    }

    pub fn heartbeat(&mut self, consumer: &ConsumerId) -> Result<()> {
        if self.sessions.touch(consumer, now_ms()) {
            Ok(())
        } else {
            Err(BrokerError::ConsumerNotConnected {
                consumer_id: consumer.clone(),
            })
        }
    }

    /// In-flight messages held by `consumer`.
    pub fn in_flight_count(&self, consumer: &ConsumerId) -> Result<usize> {
        if self.sessions.get(consumer).is_none() {
            return Err(BrokerError::ConsumerNotConnected {
                consumer_id: consumer.clone(),
            });
        }
        Ok(self.tracker.in_flight_count(consumer))
    }

    /// Disconnect every session silent for longer than the session timeout.
    pub fn reap_expired_sessions(&mut self, now_ms: i64) -> Vec<ConsumerId> {
        let expired = self
            .sessions
            .expired(now_ms, self.settings.session_timeout_ms());
        for consumer in &expired {
            warn!(consumer = %consumer, "consumer missed its heartbeats, disconnecting");
            self.disconnect(consumer);
        }
        expired
    }

    /// Background task that reaps dead sessions once per heartbeat interval.
    pub async fn start_liveness_loop(broker: SharedBroker) {
        let interval_secs = lock_broker(&broker).settings.heartbeat_interval_secs.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let reaped = lock_broker(&broker).reap_expired_sessions(now_ms());
            if !reaped.is_empty() {
                info!(count = reaped.len(), "reaped expired consumer sessions");
            }
        }
    }

    /// Close `consumer` and settle what it held, without dispatching.
    pub(crate) fn drop_session(&mut self, consumer: &ConsumerId) -> Option<(String, Vec<MessageId>)> {
        let session = self.sessions.close(consumer)?;
        let queue = session.queue_name;
        let released = self.tracker.release_all(consumer);
        for message_id in &released {
            self.settle_released(&queue, *message_id);
        }
        info!(
            consumer = %consumer,
            queue = %queue,
            released = released.len(),
            "consumer disconnected"
        );
        Some((queue, released))
    }

    /// A released message goes back to its original position, unless it has
    /// already used up its retry budget, in which case it is dead-lettered.
    fn settle_released(&mut self, queue: &str, message_id: MessageId) {
        let exhausted = match (self.store.queue(queue), self.store.get(queue, message_id)) {
            (Ok(q), Some(message)) => {
                !q.is_dead_letter() && message.delivery_count > q.options.retry_limit
            }
            _ => return,
        };

        if exhausted {
            match self.dead_letters.route(
                &mut self.store,
                queue,
                message_id,
                DeadLetterReason::RetryBudgetExhausted,
            ) {
                Ok(_) => return,
                Err(e) => warn!(queue, %message_id, "dead-lettering failed, requeueing: {e}"),
            }
        }
        if let Err(e) = self.store.restore(queue, message_id) {
            warn!(queue, %message_id, "could not requeue released message: {e}");
        }
    }
}
