//! The broker core: message store, delivery tracker, dispatcher,
//! acknowledgment handling, consumer sessions and dead-letter routing,
//! tied together by `engine::Broker`.

pub mod ack;
pub mod dead_letter;
pub mod dispatcher;
pub mod engine;
pub mod message;
pub mod session;
pub mod store;
pub mod tracker;

pub use ack::NackOutcome;
pub use engine::{Broker, QueueStats, SharedBroker, lock_broker};
pub use message::{Delivery, Message, MessageId, MessageState};
pub use session::ConsumerId;
pub use store::QueueOptions;

#[cfg(test)]
mod tests;
