//! The `persistence` module keeps the durable log behind durable queues.
//!
//! The broker only needs three things from it: append a record, read records
//! from an offset (crash recovery), and mark a record deleted. It uses `sled`
//! as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{Persistence, RetryPolicy, StoredMessage};
