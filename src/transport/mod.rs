//! The `transport` module carries the broker protocol over WebSockets.
//!
//! It defines the JSON messages exchanged with clients and the server that
//! maps them onto broker operations, one `Connection` per socket.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;
