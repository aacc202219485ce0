//! Broker engine
//!
//! `Broker` wires the message store, delivery tracker, dispatcher, session
//! manager and dead-letter router together and exposes the protocol surface:
//! declare, publish, connect/consume, ack, nack, heartbeat, disconnect, and
//! the read-only introspection queries.
//!
//! Concurrency and usage notes:
//! - The API is synchronous and meant to sit behind one lock
//!   (`SharedBroker = Arc<Mutex<Broker>>`). Every mutating call runs to
//!   completion under that lock, which is what keeps the tracker's ownership
//!   checks and the store's state transitions atomic with respect to each
//!   other. Callers must not hold the lock across network I/O.
//! - Deliveries leave the broker through unbounded per-session channels, so
//!   dispatch never blocks on a slow consumer; credit (`prefetch_limit`)
//!   bounds how much a consumer can have outstanding instead.
//! - Ack/nack handling lives in `ack.rs` and session handling in
//!   `session.rs`; both extend this type.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::dead_letter::{DEAD_LETTER_SUFFIX, DeadLetterRouter};
use crate::broker::dispatcher::Dispatcher;
use crate::broker::message::{Message, MessageId};
use crate::broker::session::SessionManager;
use crate::broker::store::{MessageStore, QueueKind, QueueOptions};
use crate::broker::tracker::DeliveryTracker;
use crate::config::{BrokerSettings, QueueSettings, Settings};
use crate::persistence::{Persistence, RetryPolicy};
use crate::utils::error::{BrokerError, Result};

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Lock the shared broker. A panic while holding the lock leaves the broker
/// state consistent at operation granularity, so poisoning is ignored.
pub fn lock_broker(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Snapshot of one queue for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub ready: usize,
    pub in_flight: usize,
    pub consumers: usize,
    pub dead_letters: usize,
}

#[derive(Debug)]
pub struct Broker {
    pub(crate) store: MessageStore,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) sessions: SessionManager,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) dead_letters: DeadLetterRouter,
    pub(crate) settings: BrokerSettings,
}

impl Broker {
    pub fn new(persistence: Persistence, settings: BrokerSettings) -> Self {
        Self {
            store: MessageStore::new(persistence),
            tracker: DeliveryTracker::new(),
            sessions: SessionManager::new(),
            dispatcher: Dispatcher::new(),
            dead_letters: DeadLetterRouter::new(),
            settings,
        }
    }

    /// A broker over a throwaway database, with default settings.
    pub fn temporary() -> Result<Self> {
        Ok(Self::new(
            Persistence::temporary()?,
            BrokerSettings::default(),
        ))
    }

    /// Open the durable log configured in `settings` and declare (and
    /// recover) every configured queue.
    pub fn open(settings: &Settings) -> Result<Self> {
        let persistence = Persistence::open(
            &settings.storage.path,
            RetryPolicy::from(&settings.storage),
        )?;
        let mut broker = Self::new(persistence, settings.broker.clone());
        for queue in &settings.queues {
            let options = broker.options_for(queue);
            broker.declare_queue(&queue.name, options)?;
        }
        Ok(broker)
    }

    pub fn into_shared(self) -> SharedBroker {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Queue options built from the broker defaults.
    pub fn default_options(&self) -> QueueOptions {
        QueueOptions {
            durable: true,
            retry_limit: self.settings.default_retry_limit,
            max_depth: self.settings.max_queue_depth,
        }
    }

    pub fn options_for(&self, queue: &QueueSettings) -> QueueOptions {
        let defaults = self.default_options();
        QueueOptions {
            durable: queue.durable.unwrap_or(defaults.durable),
            retry_limit: queue.retry_limit.unwrap_or(defaults.retry_limit),
            max_depth: queue.max_depth.or(defaults.max_depth),
        }
    }

    /// Declare a work queue together with its dead-letter queue. Declaring
    /// an existing queue is a no-op. Returns how many messages of the work
    /// queue were recovered from the durable log.
    ///
    /// Names ending in `.dlq` belong to dead-letter queues. Declaring an
    /// existing dead-letter queue is a no-op, so a monitoring consumer can
    /// declare before it consumes; any other such name is refused.
    pub fn declare_queue(&mut self, name: &str, options: QueueOptions) -> Result<usize> {
        if let Ok(queue) = self.store.queue(name) {
            if queue.is_dead_letter() {
                debug!(queue = name, "dead-letter queue already declared");
                return Ok(0);
            }
        } else if name.ends_with(DEAD_LETTER_SUFFIX) {
            return Err(BrokerError::ReservedQueueName {
                queue: name.to_string(),
            });
        }

        let existed = self.store.contains(name);
        let recovered = self.store.declare(name, options.clone(), QueueKind::Work)?;
        let recovered_dead = self
            .dead_letters
            .declare_for(&mut self.store, name, &options)?;

        if !existed {
            info!(
                queue = name,
                durable = options.durable,
                retry_limit = options.retry_limit,
                recovered,
                recovered_dead,
                "queue declared"
            );
        }
        self.redispatch(name);
        Ok(recovered)
    }

    /// Append `body` to `queue` and hand it out if a consumer has credit.
    pub fn publish(
        &mut self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        persistent: bool,
    ) -> Result<MessageId> {
        let id = self.store.append(queue, body.into(), persistent)?;
        self.dispatch(queue);
        Ok(id)
    }

    /// The oldest ready message of `queue`.
    pub fn peek(&self, queue: &str) -> Result<Option<&Message>> {
        self.store.peek(queue)
    }

    /// Ready messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> Result<usize> {
        Ok(self.store.queue(queue)?.ready_len())
    }

    /// Messages waiting in the dead-letter queue of `queue`.
    pub fn dead_letter_depth(&self, queue: &str) -> Result<usize> {
        self.store.queue(queue)?;
        let name = DeadLetterRouter::dead_letter_queue_name(queue);
        Ok(self.store.queue(&name)?.ready_len())
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let q = self.store.queue(queue)?;
        let dead_letters = if q.is_dead_letter() {
            0
        } else {
            self.dead_letter_depth(queue)?
        };
        Ok(QueueStats {
            queue: queue.to_string(),
            ready: q.ready_len(),
            in_flight: q.in_flight_len(),
            consumers: self.sessions.for_queue(queue).len(),
            dead_letters,
        })
    }

    /// Force everything written so far to disk.
    pub fn flush(&self) -> Result<()> {
        self.store.persistence().flush()?;
        Ok(())
    }

    /// Run the dispatcher over `queue` until nothing more can be handed out.
    /// Sessions found dead along the way are torn down and their messages
    /// released, which can make more work available, hence the loop.
    pub(crate) fn dispatch(&mut self, queue: &str) {
        loop {
            let outcome = self.dispatcher.dispatch(
                queue,
                &mut self.store,
                &mut self.tracker,
                &self.sessions,
            );
            if outcome.dead_consumers.is_empty() {
                break;
            }
            for consumer in outcome.dead_consumers {
                self.drop_session(&consumer);
            }
        }
    }

    /// Dispatch `queue` and, for a work queue, its dead-letter queue.
    pub(crate) fn redispatch(&mut self, queue: &str) {
        self.dispatch(queue);
        let dead_letter_queue = DeadLetterRouter::dead_letter_queue_name(queue);
        if self.store.contains(&dead_letter_queue) {
            self.dispatch(&dead_letter_queue);
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
