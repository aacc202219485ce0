use super::ack::NackOutcome;
use super::{Broker, ConsumerId, SharedBroker, lock_broker};
use super::message::{DeadLetterReason, Delivery, MessageId, MessageState};
use super::store::QueueOptions;
use super::tracker::DeliveryTracker;
use crate::config::BrokerSettings;
use crate::persistence::{Persistence, RetryPolicy};
use crate::utils::error::BrokerError;
use std::thread;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;

fn broker_with_queue(retry_limit: u32) -> Broker {
    let mut broker = Broker::temporary().unwrap();
    let options = QueueOptions {
        retry_limit,
        ..QueueOptions::default()
    };
    broker.declare_queue("jobs", options).unwrap();
    broker
}

fn next(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
    rx.try_recv().expect("expected a delivery")
}

fn publish_n(broker: &mut Broker, n: usize) -> Vec<MessageId> {
    (1..=n)
        .map(|i| broker.publish("jobs", format!("task-{i}"), true).unwrap())
        .collect()
}

#[test]
fn test_publish_to_unknown_queue_fails() {
    let mut broker = Broker::temporary().unwrap();
    let err = broker.publish("nope", "hello", true).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownQueue { queue } if queue == "nope"));
}

#[test]
fn test_connect_validates_queue_and_prefetch() {
    let mut broker = broker_with_queue(3);
    assert!(matches!(
        broker.connect("jobs", 0),
        Err(BrokerError::InvalidPrefetch)
    ));
    assert!(matches!(
        broker.connect("missing", 1),
        Err(BrokerError::UnknownQueue { .. })
    ));
}

#[test]
fn test_declare_is_idempotent() {
    let mut broker = broker_with_queue(3);
    broker.publish("jobs", "kept", true).unwrap();

    let recovered = broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);
    assert_eq!(broker.dead_letter_depth("jobs").unwrap(), 0);
}

#[test]
fn test_never_delivered_messages_dispatch_in_publish_order() {
    let mut broker = broker_with_queue(3);
    let a = broker.publish("jobs", "A", true).unwrap();
    let b = broker.publish("jobs", "B", true).unwrap();

    assert_eq!(broker.peek("jobs").unwrap().unwrap().body(), b"A");

    let (_consumer, mut rx) = broker.connect("jobs", 2).unwrap();
    assert_eq!(next(&mut rx).message_id, a);
    assert_eq!(next(&mut rx).message_id, b);
}

#[test]
fn test_dispatch_marks_message_in_flight() {
    let mut broker = broker_with_queue(3);
    let id = broker.publish("jobs", "work", true).unwrap();
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();

    let delivery = next(&mut rx);
    assert_eq!(delivery.delivery_count, 1);
    assert!(!delivery.redelivered());

    let message = broker.store.get("jobs", id).unwrap();
    assert_eq!(
        message.state(),
        &MessageState::InFlight {
            consumer: consumer.clone()
        }
    );
    assert_eq!(message.owner(), Some(&consumer));
    assert_eq!(broker.in_flight_count(&consumer).unwrap(), 1);
    assert!(broker.peek("jobs").unwrap().is_none());
}

#[test]
fn test_prefetch_limits_in_flight_messages() {
    let mut broker = broker_with_queue(3);
    publish_n(&mut broker, 5);

    let (consumer, mut rx) = broker.connect("jobs", 2).unwrap();
    next(&mut rx);
    next(&mut rx);
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.in_flight_count(&consumer).unwrap(), 2);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 3);
}

#[test]
fn test_ack_succeeds_exactly_once() {
    let mut broker = broker_with_queue(3);
    broker.publish("jobs", "once", true).unwrap();
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    let delivery = next(&mut rx);

    assert!(broker.ack(&consumer, delivery.message_id).unwrap());
    assert!(!broker.ack(&consumer, delivery.message_id).unwrap());
    assert!(broker.store.get("jobs", delivery.message_id).is_none());
    assert_eq!(broker.store.persistence().len("jobs").unwrap(), 0);
}

#[test]
fn test_ack_for_message_held_by_another_consumer_is_ignored() {
    let mut broker = broker_with_queue(3);
    publish_n(&mut broker, 2);
    let (first, mut first_rx) = broker.connect("jobs", 1).unwrap();
    let (second, _second_rx) = broker.connect("jobs", 1).unwrap();

    let delivery = next(&mut first_rx);
    assert!(!broker.ack(&second, delivery.message_id).unwrap());
    assert_eq!(
        broker.nack(&second, delivery.message_id, true).unwrap(),
        NackOutcome::Ignored
    );
    assert_eq!(broker.in_flight_count(&first).unwrap(), 1);
}

#[test]
fn test_ack_from_unknown_consumer_fails() {
    let mut broker = broker_with_queue(3);
    let err = broker.ack(&"ghost".to_string(), MessageId(1)).unwrap_err();
    assert!(matches!(err, BrokerError::ConsumerNotConnected { .. }));
}

#[test]
fn test_crash_redelivery_comes_before_newer_messages() {
    let mut broker = broker_with_queue(3);
    let ids = publish_n(&mut broker, 5);

    let (crashing, mut rx) = broker.connect("jobs", 1).unwrap();
    for expected in &ids[..2] {
        let delivery = next(&mut rx);
        assert_eq!(delivery.message_id, *expected);
        assert!(broker.ack(&crashing, delivery.message_id).unwrap());
    }
    let held = next(&mut rx);
    assert_eq!(held.message_id, ids[2]);

    // the worker dies without acking
    drop(rx);
    let released = broker.disconnect(&crashing);
    assert_eq!(released, vec![ids[2]]);

    let (replacement, mut rx) = broker.connect("jobs", 1).unwrap();
    let redelivered = next(&mut rx);
    assert_eq!(redelivered.message_id, ids[2]);
    assert_eq!(redelivered.delivery_count, 2);
    assert!(redelivered.redelivered());

    assert!(broker.ack(&replacement, redelivered.message_id).unwrap());

    for expected in &ids[3..] {
        let delivery = next(&mut rx);
        assert_eq!(delivery.message_id, *expected);
        assert!(broker.ack(&replacement, delivery.message_id).unwrap());
    }
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
}

#[test]
fn test_fair_dispatch_with_prefetch_one() {
    let mut broker = broker_with_queue(3);
    let mut consumers: Vec<_> = (0..3).map(|_| broker.connect("jobs", 1).unwrap()).collect();
    publish_n(&mut broker, 9);

    let mut processed = [0usize; 3];
    while processed.iter().sum::<usize>() < 9 {
        for (index, (consumer, rx)) in consumers.iter_mut().enumerate() {
            assert!(broker.in_flight_count(consumer).unwrap() <= 1);
            if let Ok(delivery) = rx.try_recv() {
                assert!(broker.ack(consumer, delivery.message_id).unwrap());
                processed[index] += 1;
            }

            let ready = broker.queue_depth("jobs").unwrap();
            let max = processed.iter().max().copied().unwrap_or(0);
            let min = processed.iter().min().copied().unwrap_or(0);
            // one consumer may run ahead mid-round
            assert!(max - min <= ready + 1);
        }
    }

    assert_eq!(processed, [3, 3, 3]);
}

#[test]
fn test_round_robin_prefers_oldest_session_on_ties() {
    let mut broker = broker_with_queue(3);
    let (first, mut first_rx) = broker.connect("jobs", 2).unwrap();
    let (_second, mut second_rx) = broker.connect("jobs", 2).unwrap();

    let ids = publish_n(&mut broker, 3);
    assert_eq!(next(&mut first_rx).message_id, ids[0]);
    assert_eq!(next(&mut second_rx).message_id, ids[1]);
    assert_eq!(next(&mut first_rx).message_id, ids[2]);
    assert_eq!(broker.in_flight_count(&first).unwrap(), 2);
}

#[test]
fn test_nack_requeue_goes_to_tail() {
    let mut broker = broker_with_queue(3);
    let ids = publish_n(&mut broker, 2);
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();

    let first = next(&mut rx);
    assert_eq!(first.message_id, ids[0]);
    assert_eq!(
        broker.nack(&consumer, first.message_id, true).unwrap(),
        NackOutcome::Requeued
    );

    let second = next(&mut rx);
    assert_eq!(second.message_id, ids[1]);
    broker.ack(&consumer, second.message_id).unwrap();

    let retried = next(&mut rx);
    assert_eq!(retried.message_id, ids[0]);
    assert_eq!(retried.delivery_count, 2);
}

#[test]
fn test_retry_exhaustion_dead_letters_exactly_past_the_limit() {
    let mut broker = broker_with_queue(3);
    let id = broker.publish("jobs", "poison", true).unwrap();
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();

    for attempt in 1..=3 {
        let delivery = next(&mut rx);
        assert_eq!(delivery.delivery_count, attempt);
        assert_eq!(
            broker.nack(&consumer, delivery.message_id, true).unwrap(),
            NackOutcome::Requeued
        );
        assert_eq!(broker.dead_letter_depth("jobs").unwrap(), 0);
    }

    let last = next(&mut rx);
    assert_eq!(last.delivery_count, 4);
    assert_eq!(
        broker.nack(&consumer, last.message_id, true).unwrap(),
        NackOutcome::DeadLettered {
            dead_letter_queue: "jobs.dlq".to_string(),
            reason: DeadLetterReason::RetryBudgetExhausted,
        }
    );
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
    assert_eq!(broker.dead_letter_depth("jobs").unwrap(), 1);

    let parked = broker.peek("jobs.dlq").unwrap().unwrap();
    assert_eq!(parked.delivery_count(), 0);
    assert_eq!(parked.state(), &MessageState::Ready);
    let info = parked.dead_letter().unwrap();
    assert_eq!(info.original_queue, "jobs");
    assert_eq!(info.original_id, id.0);
    assert_eq!(info.attempts, 4);
}

#[test]
fn test_nack_without_requeue_dead_letters_immediately() {
    let mut broker = broker_with_queue(3);
    broker.publish("jobs", "bad input", true).unwrap();
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    let delivery = next(&mut rx);

    let outcome = broker.nack(&consumer, delivery.message_id, false).unwrap();
    assert_eq!(
        outcome,
        NackOutcome::DeadLettered {
            dead_letter_queue: "jobs.dlq".to_string(),
            reason: DeadLetterReason::Rejected,
        }
    );
    assert_eq!(broker.in_flight_count(&consumer).unwrap(), 0);

    // monitoring consumer drains the dead-letter queue explicitly
    let (monitor, mut dlq_rx) = broker.connect("jobs.dlq", 1).unwrap();
    let parked = next(&mut dlq_rx);
    assert_eq!(parked.body, b"bad input");
    assert_eq!(parked.delivery_count, 1);
    assert_eq!(
        parked.dead_letter.as_ref().map(|d| d.reason),
        Some(DeadLetterReason::Rejected)
    );

    // rejecting from the dead-letter queue keeps the message there
    assert_eq!(
        broker.nack(&monitor, parked.message_id, false).unwrap(),
        NackOutcome::Requeued
    );
    assert_eq!(next(&mut dlq_rx).message_id, parked.message_id);
}

#[test]
fn test_released_message_past_budget_is_dead_lettered() {
    let mut broker = broker_with_queue(1);
    broker.publish("jobs", "crashes workers", true).unwrap();

    let (first, mut rx) = broker.connect("jobs", 1).unwrap();
    assert_eq!(next(&mut rx).delivery_count, 1);
    broker.disconnect(&first);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);

    let (second, mut rx) = broker.connect("jobs", 1).unwrap();
    assert_eq!(next(&mut rx).delivery_count, 2);
    broker.disconnect(&second);

    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
    assert_eq!(broker.dead_letter_depth("jobs").unwrap(), 1);
}

#[test]
fn test_disconnect_is_idempotent() {
    let mut broker = broker_with_queue(3);
    broker.publish("jobs", "held", true).unwrap();
    let (consumer, _rx) = broker.connect("jobs", 1).unwrap();

    assert_eq!(broker.disconnect(&consumer).len(), 1);
    assert!(broker.disconnect(&consumer).is_empty());
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);
}

#[test]
fn test_tracker_release_all_twice_releases_nothing_the_second_time() {
    let mut tracker = DeliveryTracker::new();
    let consumer = "c1".to_string();
    tracker.mark_in_flight(&consumer, MessageId(2));
    tracker.mark_in_flight(&consumer, MessageId(1));

    assert_eq!(
        tracker.release_all(&consumer),
        vec![MessageId(1), MessageId(2)]
    );
    assert!(tracker.release_all(&consumer).is_empty());
    assert!(tracker.is_empty());
}

#[test]
fn test_tracker_keeps_ownership_disjoint() {
    let mut tracker = DeliveryTracker::new();
    let (c1, c2) = ("c1".to_string(), "c2".to_string());

    assert!(tracker.mark_in_flight(&c1, MessageId(7)));
    assert!(!tracker.mark_in_flight(&c2, MessageId(7)));
    assert!(!tracker.mark_acked(&c2, MessageId(7)));
    assert_eq!(tracker.owner(MessageId(7)), Some(&c1));
    assert_eq!(tracker.in_flight_count(&c2), 0);

    assert!(tracker.mark_acked(&c1, MessageId(7)));
    assert!(!tracker.mark_acked(&c1, MessageId(7)));
    assert_eq!(tracker.len(), 0);
}

#[test]
fn test_closed_delivery_channel_is_treated_as_disconnect() {
    let mut broker = broker_with_queue(3);
    let (gone, rx) = broker.connect("jobs", 1).unwrap();
    drop(rx);

    let id = broker.publish("jobs", "nobody listening", true).unwrap();

    assert!(matches!(
        broker.in_flight_count(&gone),
        Err(BrokerError::ConsumerNotConnected { .. })
    ));
    let waiting = broker.peek("jobs").unwrap().unwrap();
    assert_eq!(waiting.id(), id);
    assert_eq!(waiting.delivery_count(), 0);

    let (_alive, mut rx) = broker.connect("jobs", 1).unwrap();
    assert_eq!(next(&mut rx).delivery_count, 1);
}

#[test]
fn test_missed_heartbeats_disconnect_and_requeue() {
    let mut broker = broker_with_queue(3);
    broker.publish("jobs", "slow", true).unwrap();
    let (consumer, _rx) = broker.connect("jobs", 1).unwrap();
    broker.heartbeat(&consumer).unwrap();

    let now = chrono::Utc::now().timestamp_millis();
    assert!(broker.reap_expired_sessions(now).is_empty());

    let later = now + broker.settings().session_timeout_ms() + 1_000;
    assert_eq!(broker.reap_expired_sessions(later), vec![consumer.clone()]);
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);
    assert!(matches!(
        broker.heartbeat(&consumer),
        Err(BrokerError::ConsumerNotConnected { .. })
    ));
}

#[test]
fn test_queue_full_rejects_publish() {
    let mut broker = Broker::temporary().unwrap();
    let options = QueueOptions {
        max_depth: Some(2),
        ..QueueOptions::default()
    };
    broker.declare_queue("bounded", options).unwrap();

    broker.publish("bounded", "1", true).unwrap();
    broker.publish("bounded", "2", true).unwrap();
    let err = broker.publish("bounded", "3", true).unwrap_err();
    assert!(matches!(err, BrokerError::QueueFull { max_depth: 2, .. }));
}

#[test]
fn test_non_durable_queue_keeps_nothing_on_disk() {
    let mut broker = Broker::temporary().unwrap();
    let options = QueueOptions {
        durable: false,
        ..QueueOptions::default()
    };
    broker.declare_queue("scratch", options).unwrap();
    broker.publish("scratch", "ephemeral", true).unwrap();

    assert_eq!(broker.queue_depth("scratch").unwrap(), 1);
    assert_eq!(broker.store.persistence().len("scratch").unwrap(), 0);
}

#[test]
fn test_persistent_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let acked;
    let in_flight;
    {
        let persistence = Persistence::open(path, RetryPolicy::default()).unwrap();
        let mut broker = Broker::new(persistence, BrokerSettings::default());
        broker.declare_queue("jobs", QueueOptions::default()).unwrap();

        acked = broker.publish("jobs", "done", true).unwrap();
        in_flight = broker.publish("jobs", "interrupted", true).unwrap();
        broker.publish("jobs", "transient", false).unwrap();

        let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();
        assert!(broker.ack(&consumer, next(&mut rx).message_id).unwrap());
        assert_eq!(next(&mut rx).message_id, in_flight);
        // broker goes away without any disconnect or ack
    }

    let persistence = Persistence::open(path, RetryPolicy::default()).unwrap();
    let mut broker = Broker::new(persistence, BrokerSettings::default());
    let recovered = broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    assert_eq!(recovered, 1);
    assert!(broker.store.get("jobs", acked).is_none());

    let (_consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    let delivery = next(&mut rx);
    assert_eq!(delivery.message_id, in_flight);
    assert_eq!(delivery.body, b"interrupted");
    assert_eq!(delivery.delivery_count, 2);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_queue_stats() {
    let mut broker = broker_with_queue(3);
    publish_n(&mut broker, 3);
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    let delivery = next(&mut rx);
    broker.nack(&consumer, delivery.message_id, false).unwrap();

    let stats = broker.queue_stats("jobs").unwrap();
    assert_eq!(stats.queue, "jobs");
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.consumers, 1);
    assert_eq!(stats.dead_letters, 1);
}

#[test]
fn test_undelivered_message_keeps_its_count_across_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let id;
    {
        let persistence = Persistence::open(path, RetryPolicy::default()).unwrap();
        let mut broker = Broker::new(persistence, BrokerSettings::default());
        broker.declare_queue("jobs", QueueOptions::default()).unwrap();
        for _ in 0..4 {
            let (_gone, rx) = broker.connect("jobs", 1).unwrap();
            drop(rx);
        }

        id = broker.publish("jobs", "nobody listening", true).unwrap();
        assert_eq!(broker.peek("jobs").unwrap().unwrap().delivery_count(), 0);
    }

    let persistence = Persistence::open(path, RetryPolicy::default()).unwrap();
    let on_disk = persistence.read_from("jobs", 0).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].delivery_count, 0);

    let mut broker = Broker::new(persistence, BrokerSettings::default());
    broker.declare_queue("jobs", QueueOptions::default()).unwrap();
    let (_consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    let delivery = next(&mut rx);
    assert_eq!(delivery.message_id, id);
    assert_eq!(delivery.delivery_count, 1);
}

#[test]
fn test_declaring_an_existing_dead_letter_queue_is_a_no_op() {
    let mut broker = broker_with_queue(3);

    let recovered = broker
        .declare_queue("jobs.dlq", QueueOptions::default())
        .unwrap();
    assert_eq!(recovered, 0);
    assert!(!broker.store.contains("jobs.dlq.dlq"));
    assert!(broker.store.queue("jobs.dlq").unwrap().is_dead_letter());

    let (_monitor, _rx) = broker.connect("jobs.dlq", 1).unwrap();
}

#[test]
fn test_dead_letter_suffix_is_reserved() {
    let mut broker = Broker::temporary().unwrap();

    match broker.declare_queue("foo.dlq", QueueOptions::default()) {
        Err(BrokerError::ReservedQueueName { queue }) => assert_eq!(queue, "foo.dlq"),
        other => panic!("Expected ReservedQueueName, got {other:?}"),
    }
    assert!(!broker.store.contains("foo.dlq"));

    broker.declare_queue("foo", QueueOptions::default()).unwrap();
    assert!(broker.store.queue("foo.dlq").unwrap().is_dead_letter());
}

#[test]
fn test_failed_publish_leaves_the_queue_untouched() {
    let mut broker = broker_with_queue(3);

    broker.store.persistence().inject_faults(0, 3);
    match broker.publish("jobs", "lost", true) {
        Err(BrokerError::StorageFailure(_)) => {}
        other => panic!("Expected StorageFailure, got {other:?}"),
    }
    assert_eq!(broker.queue_depth("jobs").unwrap(), 0);
    assert!(broker.peek("jobs").unwrap().is_none());

    broker.publish("jobs", "kept", true).unwrap();
    assert_eq!(broker.queue_depth("jobs").unwrap(), 1);
}

#[test]
fn test_failed_ack_keeps_the_message_with_its_consumer() {
    let mut broker = broker_with_queue(3);
    let id = broker.publish("jobs", "work", true).unwrap();
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    assert_eq!(next(&mut rx).message_id, id);

    broker.store.persistence().inject_faults(0, 3);
    match broker.ack(&consumer, id) {
        Err(BrokerError::StorageFailure(_)) => {}
        other => panic!("Expected StorageFailure, got {other:?}"),
    }
    assert_eq!(broker.in_flight_count(&consumer).unwrap(), 1);
    assert!(broker.tracker.is_owner(&consumer, id));
    assert_eq!(broker.store.get("jobs", id).unwrap().owner(), Some(&consumer));

    assert!(broker.ack(&consumer, id).unwrap());
    assert_eq!(broker.in_flight_count(&consumer).unwrap(), 0);
    assert!(broker.store.get("jobs", id).is_none());
    assert!(
        broker
            .store
            .persistence()
            .read_from("jobs", 0)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_failed_dead_lettering_keeps_the_message_in_flight() {
    let mut broker = broker_with_queue(3);
    let id = broker.publish("jobs", "poison", true).unwrap();
    let (consumer, mut rx) = broker.connect("jobs", 1).unwrap();
    next(&mut rx);

    // the copy lands (id, tree, insert), removing the original fails
    broker.store.persistence().inject_faults(3, 3);
    match broker.nack(&consumer, id, false) {
        Err(BrokerError::StorageFailure(_)) => {}
        other => panic!("Expected StorageFailure, got {other:?}"),
    }
    assert!(broker.tracker.is_owner(&consumer, id));
    let message = broker.store.get("jobs", id).unwrap();
    assert!(matches!(message.state(), MessageState::InFlight { .. }));
    assert_eq!(broker.dead_letter_depth("jobs").unwrap(), 1);

    let outcome = broker.nack(&consumer, id, false).unwrap();
    assert!(matches!(outcome, NackOutcome::DeadLettered { .. }));
    assert!(broker.store.get("jobs", id).is_none());
    // a duplicate rather than a hole
    assert_eq!(broker.dead_letter_depth("jobs").unwrap(), 2);
}

fn nack_deliveries(
    broker: &SharedBroker,
    consumer: &ConsumerId,
    rx: &mut UnboundedReceiver<Delivery>,
    count: usize,
) {
    let mut nacked = 0;
    while nacked < count {
        match rx.try_recv() {
            Ok(delivery) => {
                let outcome = lock_broker(broker)
                    .nack(consumer, delivery.message_id, true)
                    .unwrap();
                assert_eq!(outcome, NackOutcome::Requeued);
                nacked += 1;
            }
            Err(_) => thread::yield_now(),
        }
    }
}

#[test]
fn test_concurrent_nacks_keep_ownership_disjoint() {
    let mut broker = broker_with_queue(10_000);
    let mut ids = publish_n(&mut broker, 6);
    let shared = broker.into_shared();

    let (first, mut first_rx) = lock_broker(&shared).connect("jobs", 2).unwrap();
    let (second, mut second_rx) = lock_broker(&shared).connect("jobs", 2).unwrap();

    thread::scope(|s| {
        s.spawn(|| nack_deliveries(&shared, &first, &mut first_rx, 100));
        s.spawn(|| nack_deliveries(&shared, &second, &mut second_rx, 100));
    });

    let broker = lock_broker(&shared);
    let held_by_first = broker.tracker.in_flight_ids(&first);
    let held_by_second = broker.tracker.in_flight_ids(&second);
    assert!(held_by_first.iter().all(|id| !held_by_second.contains(id)));
    assert_eq!(
        broker.tracker.len(),
        held_by_first.len() + held_by_second.len()
    );

    let ready = broker.store.ready_ids("jobs").unwrap();
    for id in &ready {
        assert_eq!(
            broker.store.get("jobs", *id).unwrap().state(),
            &MessageState::Ready
        );
    }

    let mut seen: Vec<MessageId> = ready
        .iter()
        .chain(&held_by_first)
        .chain(&held_by_second)
        .copied()
        .collect();
    seen.sort();
    ids.sort();
    assert_eq!(seen, ids);
}
