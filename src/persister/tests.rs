use super::*;
use futures::FutureExt;
use crate::model::{Mutation, RecordPatch};
use crate::test_utils::{
    make_event_body, make_fields, make_mutation_body, MockRecordStore, RecordingSettler,
    Settlement, StoreFailure,
};

fn setup() -> (Arc<MockRecordStore>, BroadcastHub, Persister) {
    let store = Arc::new(MockRecordStore::new());
    let hub = BroadcastHub::default();
    let persister = Persister::new(store.clone(), hub.clone());
    (store, hub, persister)
}

#[test]
fn test_topic_for_operation() {
    assert_eq!(topic_for(Operation::Create), broadcast::RECORD_CREATED);
    assert_eq!(topic_for(Operation::Update), broadcast::RECORD_UPDATED);
    assert_eq!(topic_for(Operation::Delete), broadcast::RECORD_DELETED);
}

#[tokio::test]
async fn test_success_acks_then_broadcasts() {
    let (store, hub, persister) = setup();
    let mut listener = hub.subscribe(broadcast::RECORD_CREATED);
    let settler = RecordingSettler::new(5);

    let outcome = persister
        .on_message(settler.delivery(&make_event_body("Post 1", "abc"), 0))
        .await;

    let Outcome::Acked { record_id } = outcome else {
        panic!("Expected ack, got {:?}", outcome);
    };
    assert_eq!(settler.settlements(), vec![Settlement::Acked]);
    assert_eq!(store.record_count().await, 1);

    let notification = listener.recv().await.unwrap();
    assert_eq!(notification.payload["id"], record_id);
    assert_eq!(notification.payload["title"], "Post 1");
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered() {
    let (store, hub, persister) = setup();
    let mut listener = hub.subscribe(broadcast::ALL_TOPICS);
    let settler = RecordingSettler::new(5);

    let outcome = persister
        .on_message(settler.delivery("{not json", 0))
        .await;

    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::MalformedPayload
        }
    );
    match &settler.settlements()[..] {
        [Settlement::Nacked { requeue, .. }] => assert!(!requeue),
        other => panic!("Expected one nack, got {:?}", other),
    }
    assert_eq!(store.mutation_count(), 0);

    hub.shutdown();
    assert!(listener.recv().await.is_none());
}

#[tokio::test]
async fn test_transient_failure_requeues() {
    let (store, _hub, persister) = setup();
    store.set_failure(Some(StoreFailure::Transient)).await;
    let settler = RecordingSettler::new(5);

    let outcome = persister
        .on_message(settler.delivery(&make_event_body("Post", "x"), 0))
        .await;

    assert_eq!(
        outcome,
        Outcome::Requeued {
            redelivery_count: 1
        }
    );
    match &settler.settlements()[..] {
        [Settlement::Nacked { requeue, .. }] => assert!(requeue),
        other => panic!("Expected one nack, got {:?}", other),
    }
}

#[tokio::test]
async fn test_transient_failure_at_ceiling_is_dead_lettered() {
    let (store, _hub, persister) = setup();
    store.set_failure(Some(StoreFailure::Transient)).await;
    let settler = RecordingSettler::new(2);

    let outcome = persister
        .on_message(settler.delivery(&make_event_body("Post", "x"), 2))
        .await;

    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::TransientIo
        }
    );
}

#[tokio::test]
async fn test_validation_failure_is_dead_lettered() {
    let (store, _hub, persister) = setup();
    store.set_failure(Some(StoreFailure::Validation)).await;
    let settler = RecordingSettler::new(5);

    let outcome = persister
        .on_message(settler.delivery(&make_event_body("Post", "x"), 0))
        .await;

    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::Validation
        }
    );
}

#[tokio::test]
async fn test_update_of_missing_record_is_dead_lettered() {
    let (_store, _hub, persister) = setup();
    let settler = RecordingSettler::new(5);
    let body = make_mutation_body(
        Mutation::Update {
            id: 404,
            patch: RecordPatch {
                title: Some("X".to_string()),
                content: None,
            },
        },
        "corr-missing",
    );

    let outcome = persister.on_message(settler.delivery(&body, 0)).await;
    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            kind: ErrorKind::NotFound
        }
    );
}

#[tokio::test]
async fn test_redelivered_update_applies_once() {
    let (store, hub, persister) = setup();
    let record = store
        .create(&make_fields("old", "content"), None)
        .await
        .unwrap();
    let mut listener = hub.subscribe(broadcast::RECORD_UPDATED);
    let settler = RecordingSettler::new(5);

    let body = make_mutation_body(
        Mutation::Update {
            id: record.id,
            patch: RecordPatch {
                title: Some("X".to_string()),
                content: None,
            },
        },
        "corr-update",
    );

    let before = store.mutation_count();
    for redelivery in 0..2 {
        let outcome = persister.on_message(settler.delivery(&body, redelivery)).await;
        assert_eq!(outcome, Outcome::Acked { record_id: record.id });
    }

    assert_eq!(store.mutation_count(), before + 1);
    assert_eq!(store.get(record.id).await.unwrap().title, "X");
    assert_eq!(listener.recv().await.unwrap().payload["title"], "X");
}

#[tokio::test]
async fn test_store_without_idempotency_applies_duplicates() {
    let store = Arc::new(MockRecordStore::without_idempotency());
    let persister = Persister::new(store.clone(), BroadcastHub::default());
    let settler = RecordingSettler::new(5);
    let body = make_event_body("Post", "x");

    persister.on_message(settler.delivery(&body, 0)).await;
    persister.on_message(settler.delivery(&body, 1)).await;

    assert_eq!(store.record_count().await, 2);
}

#[tokio::test]
async fn test_failed_ack_skips_broadcast() {
    let (_store, hub, persister) = setup();
    let mut listener = hub.subscribe(broadcast::RECORD_CREATED);
    let settler = RecordingSettler::failing_ack();

    let outcome = persister
        .on_message(settler.delivery(&make_event_body("Post", "x"), 0))
        .await;

    assert_eq!(outcome, Outcome::SettleFailed);
    assert!(listener.recv().now_or_never().is_none());
}

#[tokio::test]
async fn test_delete_broadcasts_deleted_record() {
    let (store, hub, persister) = setup();
    let record = store.create(&make_fields("t", "c"), None).await.unwrap();
    let mut listener = hub.subscribe(broadcast::RECORD_DELETED);
    let settler = RecordingSettler::new(5);

    let body = make_mutation_body(Mutation::Delete { id: record.id }, "corr-del");
    persister.on_message(settler.delivery(&body, 0)).await;

    assert_eq!(listener.recv().await.unwrap().payload["id"], record.id);
    assert_eq!(store.record_count().await, 0);
}
