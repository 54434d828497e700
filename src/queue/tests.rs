use super::*;
use std::time::Duration;
use tokio::time::timeout;

const QUEUE: &str = "posts";

fn test_config(max_redeliveries: u32) -> QueueConfig {
    QueueConfig {
        max_redeliveries,
        ack_timeout_secs: 30,
        reap_interval_ms: 50,
        ..Default::default()
    }
}

async fn open(max_redeliveries: u32) -> SqliteQueue {
    SqliteQueue::open_in_memory(&test_config(max_redeliveries))
        .await
        .expect("open in-memory queue")
}

async fn enqueue(queue: &SqliteQueue, body: &str) {
    queue
        .enqueue(QUEUE, body, EnqueueOptions::default())
        .await
        .expect("enqueue");
}

async fn next(consumer: &mut QueueConsumer) -> Delivery {
    timeout(Duration::from_secs(2), consumer.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("consumer closed")
}

async fn nothing_pending(consumer: &mut QueueConsumer) -> bool {
    timeout(Duration::from_millis(100), consumer.recv())
        .await
        .is_err()
}

#[test]
fn test_error_kinds() {
    assert_eq!(
        QueueError::Connection("x".into()).kind(),
        ErrorKind::TransientIo
    );
    assert_eq!(QueueError::Closed.kind(), ErrorKind::TransientIo);
    assert_eq!(
        QueueError::UnknownDeliveryTag(DeliveryTag(1)).kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_queue_config_defaults() {
    let config = QueueConfig::default();
    assert_eq!(config.backend, QueueBackend::Sqlite);
    assert_eq!(config.name, DEFAULT_QUEUE_NAME);
    assert_eq!(config.max_redeliveries, DEFAULT_MAX_REDELIVERIES);
}

#[tokio::test]
async fn test_fifo_delivery_and_ack() {
    let queue = open(3).await;
    enqueue(&queue, "a").await;
    enqueue(&queue, "b").await;
    enqueue(&queue, "c").await;

    let mut consumer = queue.consume(QUEUE).await.unwrap();
    for expected in ["a", "b", "c"] {
        let delivery = next(&mut consumer).await;
        assert_eq!(delivery.message().body, expected);
        assert!(!delivery.message().redelivered());
        delivery.ack().await.unwrap();
    }

    let depth = queue.depth(QUEUE).await.unwrap();
    assert_eq!(depth.ready, 0);
    assert_eq!(depth.unacked, 0);
    assert_eq!(depth.consumers, 1);
}

#[tokio::test]
async fn test_unacked_message_is_not_visible_to_other_consumers() {
    let queue = open(3).await;
    let mut first = queue.consume(QUEUE).await.unwrap();
    let mut second = queue.consume(QUEUE).await.unwrap();

    enqueue(&queue, "only").await;

    let held = next(&mut first).await;
    assert!(nothing_pending(&mut second).await);

    let depth = queue.depth(QUEUE).await.unwrap();
    assert_eq!(depth.unacked, 1);
    assert_eq!(depth.ready, 0);

    held.ack().await.unwrap();
    assert!(nothing_pending(&mut second).await);
}

#[tokio::test]
async fn test_consumer_holds_one_message_at_a_time() {
    let queue = open(3).await;
    let mut consumer = queue.consume(QUEUE).await.unwrap();
    enqueue(&queue, "a").await;
    enqueue(&queue, "b").await;

    let first = next(&mut consumer).await;
    assert!(nothing_pending(&mut consumer).await);

    first.ack().await.unwrap();
    assert_eq!(next(&mut consumer).await.message().body, "b");
}

#[tokio::test]
async fn test_round_robin_across_consumers() {
    let queue = open(3).await;
    let mut first = queue.consume(QUEUE).await.unwrap();
    let mut second = queue.consume(QUEUE).await.unwrap();

    for body in ["m1", "m2", "m3", "m4"] {
        enqueue(&queue, body).await;
    }

    let d1 = next(&mut first).await;
    let d2 = next(&mut second).await;
    assert_eq!(d1.message().body, "m1");
    assert_eq!(d2.message().body, "m2");

    d1.ack().await.unwrap();
    let d3 = next(&mut first).await;
    assert_eq!(d3.message().body, "m3");

    d2.ack().await.unwrap();
    let d4 = next(&mut second).await;
    assert_eq!(d4.message().body, "m4");

    d3.ack().await.unwrap();
    d4.ack().await.unwrap();
}

#[tokio::test]
async fn test_nack_requeues_to_tail_with_count() {
    let queue = open(3).await;
    enqueue(&queue, "a").await;
    enqueue(&queue, "b").await;
    let mut consumer = queue.consume(QUEUE).await.unwrap();

    let a = next(&mut consumer).await;
    assert_eq!(
        a.nack(true, "transient").await.unwrap(),
        NackOutcome::Requeued {
            redelivery_count: 1
        }
    );

    let b = next(&mut consumer).await;
    assert_eq!(b.message().body, "b");
    b.ack().await.unwrap();

    let again = next(&mut consumer).await;
    assert_eq!(again.message().body, "a");
    assert_eq!(again.message().redelivery_count, 1);
    assert!(again.message().redelivered());
    again.ack().await.unwrap();
}

#[tokio::test]
async fn test_redelivery_ceiling_dead_letters() {
    let queue = open(2).await;
    enqueue(&queue, "poison").await;
    let mut consumer = queue.consume(QUEUE).await.unwrap();

    for expected in 1..=2 {
        let delivery = next(&mut consumer).await;
        assert_eq!(
            delivery.nack(true, "still failing").await.unwrap(),
            NackOutcome::Requeued {
                redelivery_count: expected
            }
        );
    }

    let last = next(&mut consumer).await;
    assert_eq!(last.message().redelivery_count, 2);
    assert_eq!(
        last.nack(true, "still failing").await.unwrap(),
        NackOutcome::DeadLettered
    );

    let dead = queue.dead_letters(QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, "poison");
    assert_eq!(dead[0].redelivery_count, 2);
    assert!(dead[0].reason.contains("redelivery limit"));

    assert!(nothing_pending(&mut consumer).await);
    assert_eq!(queue.depth(QUEUE).await.unwrap().ready, 0);
}

#[tokio::test]
async fn test_nack_without_requeue_dead_letters_immediately() {
    let queue = open(5).await;
    enqueue(&queue, "not json").await;
    let mut consumer = queue.consume(QUEUE).await.unwrap();

    let delivery = next(&mut consumer).await;
    assert_eq!(
        delivery.nack(false, "malformed payload").await.unwrap(),
        NackOutcome::DeadLettered
    );

    let dead = queue.dead_letters(QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "malformed payload");
    assert_eq!(dead[0].redelivery_count, 0);
}

#[tokio::test]
async fn test_dropped_delivery_is_redelivered() {
    let queue = open(3).await;
    enqueue(&queue, "a").await;
    let mut consumer = queue.consume(QUEUE).await.unwrap();

    let delivery = next(&mut consumer).await;
    drop(delivery);

    let again = next(&mut consumer).await;
    assert_eq!(again.message().body, "a");
    assert_eq!(again.message().redelivery_count, 1);
    again.ack().await.unwrap();
}

#[tokio::test]
async fn test_crashed_consumer_message_goes_to_another_consumer() {
    let queue = open(3).await;
    enqueue(&queue, "work").await;

    let mut doomed = queue.consume(QUEUE).await.unwrap();
    let (got_it, received) = tokio::sync::oneshot::channel();
    let worker = tokio::spawn(async move {
        let _held = doomed.recv().await;
        let _ = got_it.send(());
        // Hang while holding the delivery.
        std::future::pending::<()>().await;
    });
    received.await.unwrap();

    let mut survivor = queue.consume(QUEUE).await.unwrap();
    assert!(nothing_pending(&mut survivor).await);

    worker.abort();
    let _ = worker.await;

    let delivery = next(&mut survivor).await;
    assert_eq!(delivery.message().body, "work");
    assert!(delivery.message().redelivered());
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn test_ack_timeout_requeues_and_late_ack_fails() {
    let config = QueueConfig {
        ack_timeout_secs: 1,
        reap_interval_ms: 50,
        ..test_config(3)
    };
    let queue = SqliteQueue::open_in_memory(&config).await.unwrap();
    enqueue(&queue, "slow").await;
    let mut consumer = queue.consume(QUEUE).await.unwrap();

    let stale = next(&mut consumer).await;
    let fresh = timeout(Duration::from_secs(3), consumer.recv())
        .await
        .expect("lease should expire")
        .expect("consumer closed");
    assert_eq!(fresh.message().redelivery_count, 1);

    let err = stale.ack().await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownDeliveryTag(_)));
    fresh.ack().await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_reaches_other_idle_consumer() {
    let config = QueueConfig {
        ack_timeout_secs: 1,
        reap_interval_ms: 50,
        ..test_config(3)
    };
    let queue = SqliteQueue::open_in_memory(&config).await.unwrap();
    // Attached but never receives; its buffered delivery goes stale.
    let stalled = queue.consume(QUEUE).await.unwrap();
    let mut active = queue.consume(QUEUE).await.unwrap();

    enqueue(&queue, "m1").await;
    enqueue(&queue, "m2").await;

    let second = next(&mut active).await;
    assert_eq!(second.message().body, "m2");
    second.ack().await.unwrap();

    let reclaimed = timeout(Duration::from_secs(4), active.recv())
        .await
        .expect("expired message should move to the idle consumer")
        .expect("consumer closed");
    assert_eq!(reclaimed.message().body, "m1");
    assert_eq!(reclaimed.message().redelivery_count, 1);
    reclaimed.ack().await.unwrap();

    let depth = queue.depth(QUEUE).await.unwrap();
    assert_eq!(depth.ready + depth.unacked, 0);
    drop(stalled);
}

#[tokio::test]
async fn test_non_durable_enqueue_is_delivered() {
    let queue = open(3).await;
    queue
        .enqueue(QUEUE, "volatile", EnqueueOptions { durable: false })
        .await
        .unwrap();

    let mut consumer = queue.consume(QUEUE).await.unwrap();
    let delivery = next(&mut consumer).await;
    assert_eq!(delivery.message().body, "volatile");
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn test_queues_are_independent() {
    let queue = open(3).await;
    queue.declare("other").await.unwrap();
    queue
        .enqueue("other", "x", EnqueueOptions::default())
        .await
        .unwrap();

    let mut consumer = queue.consume(QUEUE).await.unwrap();
    assert!(nothing_pending(&mut consumer).await);
    assert_eq!(queue.depth("other").await.unwrap().ready, 1);
}

#[tokio::test]
async fn test_enqueue_after_shutdown_fails() {
    let queue = open(3).await;
    queue.shutdown().await;

    let result = queue.enqueue(QUEUE, "late", EnqueueOptions::default()).await;
    assert!(matches!(result, Err(QueueError::Closed)));
}

#[tokio::test]
async fn test_payload_decodes_event_body() {
    let queue = open(3).await;
    let event = crate::model::Event::new("Post 1", "Content abc");
    enqueue(&queue, &serde_json::to_string(&event).unwrap()).await;

    let mut consumer = queue.consume(QUEUE).await.unwrap();
    let delivery = next(&mut consumer).await;
    let payload = delivery.message().payload().unwrap();
    assert_eq!(payload.correlation_id, event.correlation_id);
    delivery.ack().await.unwrap();
}
