//! Tests for the in-memory broker

use super::*;
use crate::clock::ManualClock;

fn primary() -> QueueName {
    QueueName::new("email.notifications").unwrap()
}

fn retry() -> QueueName {
    QueueName::new("email.retry").unwrap()
}

fn dlq() -> QueueName {
    QueueName::new("email.dlq").unwrap()
}

/// Standard email topology: retry dead-letters into primary, primary
/// dead-letters into the DLQ.
fn email_topology() -> BrokerConfig {
    BrokerConfig::with_queues(vec![
        QueueSpec::new(primary())
            .with_max_priority(10)
            .with_dead_letter_target(dlq()),
        QueueSpec::new(retry()).with_dead_letter_target(primary()),
        QueueSpec::new(dlq()),
    ])
}

fn broker_with_clock() -> (InMemoryBroker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let broker = InMemoryBroker::with_clock(email_topology(), clock.clone());
    (broker, clock)
}

#[tokio::test]
async fn test_send_and_receive_round_trip() {
    let (broker, _clock) = broker_with_clock();

    let message = Message::new(Bytes::from_static(b"hello")).with_attribute("event_id", "evt-1");
    let message_id = broker.send_message(&primary(), message).await.unwrap();

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .expect("message should be available");

    assert_eq!(received.message_id, message_id);
    assert_eq!(received.body, Bytes::from_static(b"hello"));
    assert_eq!(received.attributes.get("event_id").unwrap(), "evt-1");
    assert_eq!(received.delivery_count, 1);
}

#[tokio::test]
async fn test_receive_from_empty_queue_returns_none() {
    let (broker, _clock) = broker_with_clock();

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap();
    assert!(received.is_none());
}

#[tokio::test]
async fn test_send_to_undeclared_queue_fails() {
    let (broker, _clock) = broker_with_clock();
    let unknown = QueueName::new("no.such.queue").unwrap();

    let result = broker
        .send_message(&unknown, Message::new(Bytes::from_static(b"x")))
        .await;
    assert!(matches!(result, Err(QueueError::QueueNotFound { .. })));
}

#[tokio::test]
async fn test_priority_ordering_highest_first() {
    let (broker, _clock) = broker_with_clock();

    for (body, priority) in [("normal", 5u8), ("critical", 10), ("low", 2)] {
        broker
            .send_message(
                &primary(),
                Message::new(Bytes::from(body.as_bytes().to_vec())).with_priority(priority),
            )
            .await
            .unwrap();
    }

    let order: Vec<Bytes> = {
        let mut bodies = Vec::new();
        while let Some(received) = broker
            .receive_message(&primary(), Duration::zero())
            .await
            .unwrap()
        {
            broker
                .complete_message(received.receipt_handle.clone())
                .await
                .unwrap();
            bodies.push(received.body);
        }
        bodies
    };

    assert_eq!(
        order,
        vec![
            Bytes::from_static(b"critical"),
            Bytes::from_static(b"normal"),
            Bytes::from_static(b"low"),
        ]
    );
}

#[tokio::test]
async fn test_fifo_within_same_priority() {
    let (broker, _clock) = broker_with_clock();

    for body in ["first", "second", "third"] {
        broker
            .send_message(
                &primary(),
                Message::new(Bytes::from(body.as_bytes().to_vec())).with_priority(5),
            )
            .await
            .unwrap();
    }

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.body, Bytes::from_static(b"first"));
}

#[tokio::test]
async fn test_priority_clamped_to_queue_maximum() {
    let (broker, _clock) = broker_with_clock();

    broker
        .send_message(
            &primary(),
            Message::new(Bytes::from_static(b"x")).with_priority(200),
        )
        .await
        .unwrap();

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.priority, 10);
}

#[tokio::test]
async fn test_delayed_message_not_available_until_delay_elapses() {
    let (broker, clock) = broker_with_clock();

    broker
        .send_message(
            &primary(),
            Message::new(Bytes::from_static(b"later")).with_delay(Duration::seconds(30)),
        )
        .await
        .unwrap();

    assert!(broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .is_none());

    clock.advance(Duration::seconds(31));

    assert!(broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_expired_message_forwarded_to_dead_letter_target() {
    let (broker, clock) = broker_with_clock();

    // Retry queue with TTL-as-delay: after the TTL, the message must appear
    // back on the primary queue.
    broker
        .send_message(
            &retry(),
            Message::new(Bytes::from_static(b"retry-me")).with_ttl(Duration::seconds(2)),
        )
        .await
        .unwrap();

    assert_eq!(broker.queue_depth(&retry()).await.unwrap(), 1);
    assert_eq!(broker.queue_depth(&primary()).await.unwrap(), 0);

    clock.advance(Duration::seconds(3));

    assert_eq!(broker.queue_depth(&retry()).await.unwrap(), 0);
    assert_eq!(broker.queue_depth(&primary()).await.unwrap(), 1);

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.body, Bytes::from_static(b"retry-me"));
}

#[tokio::test]
async fn test_forward_ttl_replaces_spent_ttl_after_forward() {
    let (broker, clock) = broker_with_clock();

    // Delay-queue round trip: 2s on the retry queue, then a fresh 5s
    // expiry on the primary queue instead of the already-spent delay
    broker
        .send_message(
            &retry(),
            Message::new(Bytes::from_static(b"retry-me"))
                .with_ttl(Duration::seconds(2))
                .with_forward_ttl(Duration::seconds(5)),
        )
        .await
        .unwrap();

    clock.advance(Duration::seconds(3));
    assert_eq!(broker.queue_depth(&primary()).await.unwrap(), 1);

    // The forward TTL applies once: primary expiry moves it to the DLQ,
    // where it stays
    clock.advance(Duration::seconds(6));
    assert_eq!(broker.queue_depth(&primary()).await.unwrap(), 0);
    assert_eq!(broker.queue_depth(&dlq()).await.unwrap(), 1);

    clock.advance(Duration::hours(1));
    assert_eq!(broker.queue_depth(&dlq()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_expired_message_without_target_is_dropped() {
    let config = BrokerConfig::with_queues(vec![QueueSpec::new(dlq())]);
    let clock = Arc::new(ManualClock::new());
    let broker = InMemoryBroker::with_clock(config, clock.clone());

    broker
        .send_message(
            &dlq(),
            Message::new(Bytes::from_static(b"x")).with_ttl(Duration::seconds(1)),
        )
        .await
        .unwrap();

    clock.advance(Duration::seconds(2));

    assert_eq!(broker.queue_depth(&dlq()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_in_flight_message_invisible_to_other_consumers() {
    let (broker, _clock) = broker_with_clock();

    broker
        .send_message(&primary(), Message::new(Bytes::from_static(b"x")))
        .await
        .unwrap();

    let first = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap();
    assert!(first.is_some());

    // Still locked; a second consumer sees nothing
    let second = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn test_visibility_timeout_releases_lock() {
    let (broker, clock) = broker_with_clock();

    broker
        .send_message(&primary(), Message::new(Bytes::from_static(b"x")))
        .await
        .unwrap();

    let first = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.delivery_count, 1);

    // Default visibility timeout is 30s
    clock.advance(Duration::seconds(31));

    let second = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.delivery_count, 2);
}

#[tokio::test]
async fn test_complete_removes_message_permanently() {
    let (broker, clock) = broker_with_clock();

    broker
        .send_message(&primary(), Message::new(Bytes::from_static(b"x")))
        .await
        .unwrap();

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    broker.complete_message(received.receipt_handle).await.unwrap();

    clock.advance(Duration::seconds(60));
    assert!(broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_complete_with_stale_receipt_fails() {
    let (broker, _clock) = broker_with_clock();

    broker
        .send_message(&primary(), Message::new(Bytes::from_static(b"x")))
        .await
        .unwrap();

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    broker
        .complete_message(received.receipt_handle.clone())
        .await
        .unwrap();

    let result = broker.complete_message(received.receipt_handle).await;
    assert!(matches!(result, Err(QueueError::MessageNotFound { .. })));
}

#[tokio::test]
async fn test_abandon_returns_message_to_queue() {
    let (broker, _clock) = broker_with_clock();

    broker
        .send_message(&primary(), Message::new(Bytes::from_static(b"x")))
        .await
        .unwrap();

    let received = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    broker.abandon_message(received.receipt_handle).await.unwrap();

    let redelivered = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.delivery_count, 2);
}

#[tokio::test]
async fn test_queue_depth_counts_waiting_messages_only() {
    let (broker, _clock) = broker_with_clock();

    for _ in 0..3 {
        broker
            .send_message(&primary(), Message::new(Bytes::from_static(b"x")))
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth(&primary()).await.unwrap(), 3);

    let _in_flight = broker
        .receive_message(&primary(), Duration::zero())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.queue_depth(&primary()).await.unwrap(), 2);
}
