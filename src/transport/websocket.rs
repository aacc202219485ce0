//! WebSocket transport
//!
//! Translates protocol JSON frames into broker operations. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Keep one outbox channel per connection, drained by a send loop, so the
//!   broker lock is never held across socket writes
//! - Track the consumer sessions a connection opened. Each session gets a
//!   forwarding task that turns deliveries into `delivery` frames
//! - Disconnect every owned session when the socket goes away, which puts
//!   their unacknowledged messages back in their queues

use std::collections::HashSet;
use std::io;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::message::{Delivery, MessageId};
use crate::broker::{Broker, ConsumerId, QueueOptions, SharedBroker, lock_broker};
use crate::transport::message::{ClientMessage, DeliveryFrame, ServerMessage};
use crate::utils::error::Result;

pub async fn start_websocket_server(addr: &str, broker: SharedBroker) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, broker).await
}

/// Accept connections on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, broker: SharedBroker) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted tcp connection");
                spawn(handle_connection(stream, broker.clone()));
            }
            Err(e) if is_transient(&e) => {
                warn!("accept failed, continuing: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn handle_connection(stream: TcpStream, broker: SharedBroker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut connection = Connection::new(broker, tx);
    let connection_id = connection.id().to_string();
    info!(connection = %connection_id, "client connected");

    {
        let connection_id = connection_id.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(connection = %connection_id, "send failed: {e}");
                    break;
                }
            }
            debug!(connection = %connection_id, "send loop closed");
        });
    }

    while let Some(frame) = ws_receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = %connection_id, "read failed: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        match msg.to_text() {
            Ok(text) => connection.handle_text(text),
            Err(e) => warn!(connection = %connection_id, "unreadable text frame: {e}"),
        }
    }

    connection.close();
    info!(connection = %connection_id, "client disconnected");
}

/// Protocol state of one client connection.
#[derive(Debug)]
pub struct Connection {
    id: String,
    broker: SharedBroker,
    outbox: UnboundedSender<WsMessage>,
    consumers: HashSet<ConsumerId>,
}

impl Connection {
    pub fn new(broker: SharedBroker, outbox: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            broker,
            outbox,
            consumers: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consumer sessions opened over this connection and not yet cancelled.
    pub fn consumers(&self) -> &HashSet<ConsumerId> {
        &self.consumers
    }

    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!(
                    connection = %self.id,
                    "invalid client message: {e} | {}",
                    text.chars().take(100).collect::<String>()
                );
                self.send(&ServerMessage::error(format!("invalid message: {e}")));
            }
        }
    }

    /// Apply one client request. Every request gets exactly one reply on the
    /// outbox; `consume` may be followed by deliveries.
    pub fn handle_message(&mut self, message: ClientMessage) {
        let reply = match message {
            ClientMessage::Declare {
                queue,
                durable,
                retry_limit,
                max_depth,
            } => {
                let mut broker = lock_broker(&self.broker);
                let defaults = broker.default_options();
                let options = QueueOptions {
                    durable: durable.unwrap_or(defaults.durable),
                    retry_limit: retry_limit.unwrap_or(defaults.retry_limit),
                    max_depth: max_depth.or(defaults.max_depth),
                };
                match broker.declare_queue(&queue, options) {
                    Ok(recovered) => ServerMessage::Declared { queue, recovered },
                    Err(e) => ServerMessage::error(e.to_string()),
                }
            }
            ClientMessage::Publish {
                queue,
                body,
                persistent,
            } => match lock_broker(&self.broker).publish(&queue, body, persistent) {
                Ok(id) => ServerMessage::Published {
                    queue,
                    message_id: id.0,
                },
                Err(e) => ServerMessage::error(e.to_string()),
            },
            ClientMessage::Consume { queue, prefetch } => {
                self.consume(queue, prefetch);
                return;
            }
            ClientMessage::Ack {
                consumer_id,
                message_id,
            } => self.with_owned(&consumer_id, |broker, consumer| {
                broker
                    .ack(consumer, MessageId(message_id))
                    .map(|acked| ServerMessage::Acked {
                        consumer_id: consumer.clone(),
                        message_id,
                        acked,
                    })
            }),
            ClientMessage::Nack {
                consumer_id,
                message_id,
                requeue,
            } => self.with_owned(&consumer_id, |broker, consumer| {
                broker
                    .nack(consumer, MessageId(message_id), requeue)
                    .map(|outcome| ServerMessage::Nacked {
                        consumer_id: consumer.clone(),
                        message_id,
                        outcome,
                    })
            }),
            ClientMessage::Heartbeat { consumer_id } => {
                self.with_owned(&consumer_id, |broker, consumer| {
                    broker.heartbeat(consumer).map(|_| ServerMessage::HeartbeatOk {
                        consumer_id: consumer.clone(),
                    })
                })
            }
            ClientMessage::Cancel { consumer_id } => {
                if self.consumers.remove(&consumer_id) {
                    let released = lock_broker(&self.broker).disconnect(&consumer_id);
                    ServerMessage::Cancelled {
                        consumer_id,
                        released: released.into_iter().map(|id| id.0).collect(),
                    }
                } else {
                    not_owned(&consumer_id)
                }
            }
            ClientMessage::Stats { queue } => match lock_broker(&self.broker).queue_stats(&queue) {
                Ok(stats) => ServerMessage::Stats(stats),
                Err(e) => ServerMessage::error(e.to_string()),
            },
        };
        self.send(&reply);
    }

    /// Disconnect every session this connection still owns.
    pub fn close(&mut self) {
        if self.consumers.is_empty() {
            return;
        }
        let mut broker = lock_broker(&self.broker);
        for consumer in self.consumers.drain() {
            let released = broker.disconnect(&consumer);
            debug!(
                connection = %self.id,
                consumer = %consumer,
                released = released.len(),
                "closed consumer with connection"
            );
        }
    }

    fn consume(&mut self, queue: String, prefetch: Option<u32>) {
        let connected = {
            let mut broker = lock_broker(&self.broker);
            let prefetch = prefetch.unwrap_or(broker.settings().default_prefetch);
            broker.connect(&queue, prefetch)
        };
        match connected {
            Ok((consumer_id, deliveries)) => {
                self.consumers.insert(consumer_id.clone());
                // the reply must reach the client before any delivery
                self.send(&ServerMessage::ConsumeOk {
                    queue,
                    consumer_id: consumer_id.clone(),
                });
                spawn_forwarder(consumer_id, deliveries, self.outbox.clone());
            }
            Err(e) => {
                self.send(&ServerMessage::error(e.to_string()));
            }
        }
    }

    fn with_owned<F>(&self, consumer: &ConsumerId, op: F) -> ServerMessage
    where
        F: FnOnce(&mut Broker, &ConsumerId) -> Result<ServerMessage>,
    {
        if !self.consumers.contains(consumer) {
            return not_owned(consumer);
        }
        let mut broker = lock_broker(&self.broker);
        op(&mut *broker, consumer).unwrap_or_else(|e| ServerMessage::error(e.to_string()))
    }

    fn send(&self, message: &ServerMessage) -> bool {
        send_json(&self.outbox, message)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn not_owned(consumer: &ConsumerId) -> ServerMessage {
    ServerMessage::error(format!("consumer {consumer} is not owned by this connection"))
}

fn spawn_forwarder(
    consumer_id: ConsumerId,
    mut deliveries: UnboundedReceiver<Delivery>,
    outbox: UnboundedSender<WsMessage>,
) {
    spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let frame = DeliveryFrame::new(&consumer_id, &delivery);
            if !send_json(&outbox, &ServerMessage::Delivery(frame)) {
                break;
            }
        }
        debug!(consumer = %consumer_id, "delivery forwarder stopped");
    });
}

fn send_json(outbox: &UnboundedSender<WsMessage>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => outbox.send(WsMessage::Text(text.into())).is_ok(),
        Err(e) => {
            error!("failed to serialize server message: {e}");
            false
        }
    }
}
