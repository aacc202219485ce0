//! # PopQueue
//!
//! `popqueue` is a durable work-queue broker. Producers append messages to
//! named queues, consumers pull them under a prefetch budget and acknowledge
//! each one, and anything a consumer took but never settled is handed to
//! another consumer once the first one disconnects or stops heartbeating.
//! Messages that keep failing end up in a per-queue dead-letter queue.
//!
//! ## Core Modules
//!
//! - `broker`: Queues, dispatch, acknowledgments, consumer sessions and dead-lettering.
//! - `client`: In-process consumers and a WebSocket client for remote brokers.
//! - `config`: Loads settings from `config/default.*` and `POPQUEUE_*` environment variables.
//! - `persistence`: The sled-backed message log that survives restarts.
//! - `transport`: The WebSocket server and its JSON protocol.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
