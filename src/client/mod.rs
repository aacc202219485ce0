//! The `client` module holds the consumer-side handles.
//!
//! - `consumer`: in-process consumers bound to a `SharedBroker`
//! - `remote`: a websocket client speaking the transport protocol

pub mod consumer;
pub mod remote;

pub use consumer::{AutoAckConsumer, Consumer, ManualAckConsumer};
pub use remote::RemoteClient;
