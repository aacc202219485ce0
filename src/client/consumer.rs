//! In-process consumers
//!
//! Thin handles over a `SharedBroker` session. `ManualAckConsumer` leaves
//! settling to the caller; `AutoAckConsumer` acknowledges each message
//! before handing it out, trading redelivery for at-most-once processing.
//!
//! Dropping a consumer disconnects its session, so a worker that panics or
//! returns early without acking behaves like a crashed remote worker.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

use crate::broker::message::{Delivery, MessageId};
use crate::broker::{ConsumerId, NackOutcome, SharedBroker, lock_broker};
use crate::utils::error::Result;

#[async_trait]
pub trait Consumer: Send {
    fn id(&self) -> &ConsumerId;

    fn queue(&self) -> &str;

    /// Wait for the next message. `None` once the session is gone.
    async fn next_delivery(&mut self) -> Option<Delivery>;
}

#[derive(Debug)]
pub struct ManualAckConsumer {
    broker: SharedBroker,
    id: ConsumerId,
    queue: String,
    deliveries: UnboundedReceiver<Delivery>,
    disconnected: bool,
}

impl ManualAckConsumer {
    pub fn connect(broker: &SharedBroker, queue: &str, prefetch_limit: u32) -> Result<Self> {
        let (id, deliveries) = lock_broker(broker).connect(queue, prefetch_limit)?;
        Ok(Self {
            broker: broker.clone(),
            id,
            queue: queue.to_string(),
            deliveries,
            disconnected: false,
        })
    }

    /// A delivery that is already waiting, without blocking.
    pub fn try_next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    pub fn ack(&self, message_id: MessageId) -> Result<bool> {
        lock_broker(&self.broker).ack(&self.id, message_id)
    }

    pub fn nack(&self, message_id: MessageId, requeue: bool) -> Result<NackOutcome> {
        lock_broker(&self.broker).nack(&self.id, message_id, requeue)
    }

    pub fn heartbeat(&self) -> Result<()> {
        lock_broker(&self.broker).heartbeat(&self.id)
    }

    /// Close the session, releasing everything not yet acked.
    pub fn disconnect(mut self) -> Vec<MessageId> {
        self.disconnected = true;
        lock_broker(&self.broker).disconnect(&self.id)
    }
}

#[async_trait]
impl Consumer for ManualAckConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

impl Drop for ManualAckConsumer {
    fn drop(&mut self) {
        if !self.disconnected {
            lock_broker(&self.broker).disconnect(&self.id);
        }
    }
}

#[derive(Debug)]
pub struct AutoAckConsumer {
    inner: ManualAckConsumer,
}

impl AutoAckConsumer {
    pub fn connect(broker: &SharedBroker, queue: &str, prefetch_limit: u32) -> Result<Self> {
        Ok(Self {
            inner: ManualAckConsumer::connect(broker, queue, prefetch_limit)?,
        })
    }

    pub fn disconnect(self) -> Vec<MessageId> {
        self.inner.disconnect()
    }
}

#[async_trait]
impl Consumer for AutoAckConsumer {
    fn id(&self) -> &ConsumerId {
        self.inner.id()
    }

    fn queue(&self) -> &str {
        self.inner.queue()
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let delivery = self.inner.next_delivery().await?;
            match self.inner.ack(delivery.message_id) {
                Ok(true) => return Some(delivery),
                // released in the meantime, it will come around again
                Ok(false) => continue,
                Err(e) => {
                    warn!(consumer = %self.inner.id, "auto-ack failed: {e}");
                    return None;
                }
            }
        }
    }
}
