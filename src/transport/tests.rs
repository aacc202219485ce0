use crate::broker::message::DeadLetterReason;
use crate::broker::{Broker, NackOutcome, SharedBroker, lock_broker};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::websocket::Connection;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tungstenite::protocol::Message as WsMessage;

fn setup() -> (SharedBroker, Connection, UnboundedReceiver<WsMessage>) {
    let broker = Broker::temporary().unwrap().into_shared();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection::new(broker.clone(), tx);
    (broker, connection, rx)
}

async fn reply(rx: &mut UnboundedReceiver<WsMessage>) -> ServerMessage {
    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a server message")
        .expect("outbox closed");
    if let WsMessage::Text(text) = frame {
        serde_json::from_str(&text).unwrap()
    } else {
        panic!("Expected a text message");
    }
}

fn declare(connection: &mut Connection, queue: &str) {
    connection.handle_message(ClientMessage::Declare {
        queue: queue.to_string(),
        durable: None,
        retry_limit: None,
        max_depth: None,
    });
}

fn publish(connection: &mut Connection, queue: &str, body: &str) {
    connection.handle_message(ClientMessage::Publish {
        queue: queue.to_string(),
        body: body.to_string(),
        persistent: true,
    });
}

async fn consume(
    connection: &mut Connection,
    rx: &mut UnboundedReceiver<WsMessage>,
    queue: &str,
    prefetch: u32,
) -> String {
    connection.handle_message(ClientMessage::Consume {
        queue: queue.to_string(),
        prefetch: Some(prefetch),
    });
    match reply(rx).await {
        ServerMessage::ConsumeOk { consumer_id, .. } => consumer_id,
        other => panic!("Expected ConsumeOk, got {other:?}"),
    }
}

#[test]
fn test_publish_defaults_to_persistent() {
    let msg: ClientMessage =
        serde_json::from_str(r#"{"type":"publish","queue":"jobs","body":"hi"}"#).unwrap();
    assert_eq!(
        msg,
        ClientMessage::Publish {
            queue: "jobs".to_string(),
            body: "hi".to_string(),
            persistent: true,
        }
    );
}

#[tokio::test]
async fn test_declare_and_publish() {
    let (broker, mut connection, mut rx) = setup();

    declare(&mut connection, "jobs");
    assert_eq!(
        reply(&mut rx).await,
        ServerMessage::Declared {
            queue: "jobs".to_string(),
            recovered: 0
        }
    );

    publish(&mut connection, "jobs", "hello");
    match reply(&mut rx).await {
        ServerMessage::Published { queue, .. } => assert_eq!(queue, "jobs"),
        other => panic!("Expected Published, got {other:?}"),
    }
    assert_eq!(lock_broker(&broker).queue_depth("jobs").unwrap(), 1);
}

#[tokio::test]
async fn test_publish_to_unknown_queue_replies_error() {
    let (_broker, mut connection, mut rx) = setup();
    publish(&mut connection, "missing", "hello");

    match reply(&mut rx).await {
        ServerMessage::Error { message } => assert!(message.contains("missing")),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_json_replies_error() {
    let (_broker, mut connection, mut rx) = setup();
    connection.handle_text(&json!({ "type": "subscribe", "topic": "x" }).to_string());

    match reply(&mut rx).await {
        ServerMessage::Error { message } => assert!(message.starts_with("invalid message")),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_consume_ok_precedes_deliveries() {
    let (_broker, mut connection, mut rx) = setup();
    declare(&mut connection, "jobs");
    reply(&mut rx).await;
    for body in ["first", "second"] {
        publish(&mut connection, "jobs", body);
        reply(&mut rx).await;
    }

    let consumer_id = consume(&mut connection, &mut rx, "jobs", 2).await;
    for expected in ["first", "second"] {
        match reply(&mut rx).await {
            ServerMessage::Delivery(frame) => {
                assert_eq!(frame.consumer_id, consumer_id);
                assert_eq!(frame.body, expected);
                assert_eq!(frame.delivery_count, 1);
                assert!(!frame.redelivered);
            }
            other => panic!("Expected Delivery, got {other:?}"),
        }
    }
    assert!(connection.consumers().contains(&consumer_id));
}

#[tokio::test]
async fn test_ack_for_foreign_consumer_is_rejected() {
    let (broker, mut owner, mut owner_rx) = setup();
    let (tx, mut other_rx) = mpsc::unbounded_channel();
    let mut other = Connection::new(broker.clone(), tx);

    declare(&mut owner, "jobs");
    reply(&mut owner_rx).await;
    publish(&mut owner, "jobs", "work");
    reply(&mut owner_rx).await;
    let consumer_id = consume(&mut owner, &mut owner_rx, "jobs", 1).await;
    let message_id = match reply(&mut owner_rx).await {
        ServerMessage::Delivery(frame) => frame.message_id,
        other => panic!("Expected Delivery, got {other:?}"),
    };

    other.handle_message(ClientMessage::Ack {
        consumer_id: consumer_id.clone(),
        message_id,
    });
    match reply(&mut other_rx).await {
        ServerMessage::Error { message } => assert!(message.contains("not owned")),
        other => panic!("Expected Error, got {other:?}"),
    }

    owner.handle_message(ClientMessage::Ack {
        consumer_id: consumer_id.clone(),
        message_id,
    });
    assert_eq!(
        reply(&mut owner_rx).await,
        ServerMessage::Acked {
            consumer_id,
            message_id,
            acked: true
        }
    );
    assert_eq!(lock_broker(&broker).queue_depth("jobs").unwrap(), 0);
}

#[tokio::test]
async fn test_nack_reports_dead_letter_outcome() {
    let (broker, mut connection, mut rx) = setup();
    declare(&mut connection, "jobs");
    reply(&mut rx).await;
    publish(&mut connection, "jobs", "bad");
    reply(&mut rx).await;
    let consumer_id = consume(&mut connection, &mut rx, "jobs", 1).await;
    let message_id = match reply(&mut rx).await {
        ServerMessage::Delivery(frame) => frame.message_id,
        other => panic!("Expected Delivery, got {other:?}"),
    };

    connection.handle_message(ClientMessage::Nack {
        consumer_id,
        message_id,
        requeue: false,
    });
    match reply(&mut rx).await {
        ServerMessage::Nacked { outcome, .. } => assert_eq!(
            outcome,
            NackOutcome::DeadLettered {
                dead_letter_queue: "jobs.dlq".to_string(),
                reason: DeadLetterReason::Rejected,
            }
        ),
        other => panic!("Expected Nacked, got {other:?}"),
    }
    assert_eq!(lock_broker(&broker).dead_letter_depth("jobs").unwrap(), 1);
}

#[tokio::test]
async fn test_cancel_releases_held_messages() {
    let (broker, mut connection, mut rx) = setup();
    declare(&mut connection, "jobs");
    reply(&mut rx).await;
    publish(&mut connection, "jobs", "held");
    reply(&mut rx).await;
    let consumer_id = consume(&mut connection, &mut rx, "jobs", 1).await;
    let message_id = match reply(&mut rx).await {
        ServerMessage::Delivery(frame) => frame.message_id,
        other => panic!("Expected Delivery, got {other:?}"),
    };

    connection.handle_message(ClientMessage::Cancel {
        consumer_id: consumer_id.clone(),
    });
    assert_eq!(
        reply(&mut rx).await,
        ServerMessage::Cancelled {
            consumer_id: consumer_id.clone(),
            released: vec![message_id]
        }
    );
    assert!(connection.consumers().is_empty());
    assert_eq!(lock_broker(&broker).queue_depth("jobs").unwrap(), 1);

    connection.handle_message(ClientMessage::Heartbeat { consumer_id });
    match reply(&mut rx).await {
        ServerMessage::Error { .. } => {}
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_closing_connection_disconnects_its_consumers() {
    let (broker, mut connection, mut rx) = setup();
    declare(&mut connection, "jobs");
    reply(&mut rx).await;
    publish(&mut connection, "jobs", "in progress");
    reply(&mut rx).await;
    consume(&mut connection, &mut rx, "jobs", 1).await;
    reply(&mut rx).await;

    assert_eq!(lock_broker(&broker).queue_depth("jobs").unwrap(), 0);
    connection.close();

    let broker = lock_broker(&broker);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);
    assert_eq!(broker.queue_stats("jobs").unwrap().consumers, 0);
}

#[tokio::test]
async fn test_stats_reply() {
    let (_broker, mut connection, mut rx) = setup();
    declare(&mut connection, "jobs");
    reply(&mut rx).await;
    publish(&mut connection, "jobs", "a");
    reply(&mut rx).await;

    connection.handle_message(ClientMessage::Stats {
        queue: "jobs".to_string(),
    });
    match reply(&mut rx).await {
        ServerMessage::Stats(stats) => {
            assert_eq!(stats.ready, 1);
            assert_eq!(stats.in_flight, 0);
            assert_eq!(stats.dead_letters, 0);
        }
        other => panic!("Expected Stats, got {other:?}"),
    }
}
