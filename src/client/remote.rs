//! WebSocket client for a remote broker.
//!
//! Requests are answered in order, but deliveries for the client's consumers
//! can arrive at any point, including between a request and its reply. Those
//! are buffered and handed out by `next_delivery`.

use std::collections::VecDeque;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::MessageId;
use crate::broker::{ConsumerId, NackOutcome, QueueStats};
use crate::transport::message::{ClientMessage, DeliveryFrame, ServerMessage};
use crate::utils::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RemoteClient {
    ws: WsStream,
    deliveries: VecDeque<DeliveryFrame>,
}

impl RemoteClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws, _response) = connect_async(url).await?;
        debug!(url, "connected to broker");
        Ok(Self {
            ws,
            deliveries: VecDeque::new(),
        })
    }

    /// Declare `queue` with the server's default options. Returns the
    /// number of messages recovered from disk.
    pub async fn declare(&mut self, queue: &str) -> Result<usize, ClientError> {
        let request = ClientMessage::Declare {
            queue: queue.to_string(),
            durable: None,
            retry_limit: None,
            max_depth: None,
        };
        match self.request(request).await? {
            ServerMessage::Declared { recovered, .. } => Ok(recovered),
            other => Err(unexpected(other)),
        }
    }

    pub async fn publish(
        &mut self,
        queue: &str,
        body: &str,
        persistent: bool,
    ) -> Result<MessageId, ClientError> {
        let request = ClientMessage::Publish {
            queue: queue.to_string(),
            body: body.to_string(),
            persistent,
        };
        match self.request(request).await? {
            ServerMessage::Published { message_id, .. } => Ok(MessageId(message_id)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn consume(&mut self, queue: &str, prefetch: u32) -> Result<ConsumerId, ClientError> {
        let request = ClientMessage::Consume {
            queue: queue.to_string(),
            prefetch: Some(prefetch),
        };
        match self.request(request).await? {
            ServerMessage::ConsumeOk { consumer_id, .. } => Ok(consumer_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ack(
        &mut self,
        consumer_id: &ConsumerId,
        message_id: MessageId,
    ) -> Result<bool, ClientError> {
        let request = ClientMessage::Ack {
            consumer_id: consumer_id.clone(),
            message_id: message_id.0,
        };
        match self.request(request).await? {
            ServerMessage::Acked { acked, .. } => Ok(acked),
            other => Err(unexpected(other)),
        }
    }

    pub async fn nack(
        &mut self,
        consumer_id: &ConsumerId,
        message_id: MessageId,
        requeue: bool,
    ) -> Result<NackOutcome, ClientError> {
        let request = ClientMessage::Nack {
            consumer_id: consumer_id.clone(),
            message_id: message_id.0,
            requeue,
        };
        match self.request(request).await? {
            ServerMessage::Nacked { outcome, .. } => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn heartbeat(&mut self, consumer_id: &ConsumerId) -> Result<(), ClientError> {
        let request = ClientMessage::Heartbeat {
            consumer_id: consumer_id.clone(),
        };
        match self.request(request).await? {
            ServerMessage::HeartbeatOk { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Close one consumer session. Returns the ids it released.
    pub async fn cancel(&mut self, consumer_id: &ConsumerId) -> Result<Vec<MessageId>, ClientError> {
        let request = ClientMessage::Cancel {
            consumer_id: consumer_id.clone(),
        };
        match self.request(request).await? {
            ServerMessage::Cancelled { released, .. } => {
                self.deliveries.retain(|d| &d.consumer_id != consumer_id);
                Ok(released.into_iter().map(MessageId).collect())
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn stats(&mut self, queue: &str) -> Result<QueueStats, ClientError> {
        let request = ClientMessage::Stats {
            queue: queue.to_string(),
        };
        match self.request(request).await? {
            ServerMessage::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Next delivery for any of this client's consumers.
    pub async fn next_delivery(&mut self) -> Result<DeliveryFrame, ClientError> {
        if let Some(delivery) = self.deliveries.pop_front() {
            return Ok(delivery);
        }
        loop {
            match self.read().await? {
                ServerMessage::Delivery(delivery) => return Ok(delivery),
                other => debug!(?other, "ignoring unsolicited server message"),
            }
        }
    }

    /// Close the socket. The server disconnects every consumer of this
    /// client, releasing their unacknowledged messages.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn request(&mut self, request: ClientMessage) -> Result<ServerMessage, ClientError> {
        let text = serde_json::to_string(&request)?;
        self.ws.send(WsMessage::Text(text.into())).await?;
        loop {
            match self.read().await? {
                ServerMessage::Delivery(delivery) => self.deliveries.push_back(delivery),
                ServerMessage::Error { message } => return Err(ClientError::Server(message)),
                reply => return Ok(reply),
            }
        }
    }

    async fn read(&mut self) -> Result<ServerMessage, ClientError> {
        while let Some(frame) = self.ws.next().await {
            match frame? {
                WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
                WsMessage::Close(_) => return Err(ClientError::Closed),
                _ => continue,
            }
        }
        Err(ClientError::Closed)
    }
}

fn unexpected(reply: ServerMessage) -> ClientError {
    ClientError::UnexpectedReply(format!("{reply:?}"))
}
