use std::sync::Arc;
use std::time::Duration;

use blobflow::notifier::{
    blob_notifier_definition_with_retry, register_activities, InMemoryQueue, RecordingNotifier, DRAIN_QUEUE,
    NOTIFY_ADMIN,
};
use blobflow::providers::HistoryStore;
use blobflow::{ActivityError, ActivityRegistry, BackoffStrategy, Client, InstanceStatus, RetryPolicy, Runtime};
use tokio::sync::Notify;

mod common;
use common::*;

#[tokio::test]
async fn cancel_while_activity_in_flight() {
    let gate = Arc::new(Notify::new());
    let g = gate.clone();
    let h = start_notifier_with(in_memory_store(), RecordingNotifier::default(), move |b| {
        b.register(NOTIFY_ADMIN, move |_| {
            let g = g.clone();
            async move {
                g.notified().await;
                "true".to_string()
            }
        })
    })
    .await;

    let id = h.rt.create_typed(&photo()).await.unwrap();
    assert!(
        wait_for_history(
            &h.store,
            &id,
            |hist| hist.iter().any(|e| e.activity_name() == Some(NOTIFY_ADMIN)),
            5_000
        )
        .await
    );

    assert!(h.rt.cancel(&id, "operator").await.unwrap());
    let snapshot = h.rt.wait_for_terminal(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Cancelled);
    assert_eq!(
        shape(&snapshot.history)[3..],
        [ev("CancelRequested", None), ev("InstanceCancelled", None)]
    );

    // The in-flight attempt finishes and is recorded, but nothing follows it.
    gate.notify_one();
    assert!(
        wait_for_history(
            &h.store,
            &id,
            |hist| hist.iter().any(|e| e.kind_name() == "ActivityCompleted" && e.activity_name() == Some(NOTIFY_ADMIN)),
            5_000
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = h.rt.status(&id).await.unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Cancelled);
    assert_eq!(count_scheduled(&after.history, DRAIN_QUEUE), 0);

    assert!(!h.rt.cancel(&id, "again").await.unwrap());
    h.rt.shutdown().await;
}

#[tokio::test]
async fn cancel_during_backoff_abandons_retries() {
    let queue = Arc::new(InMemoryQueue::default());
    let admin = Arc::new(RecordingNotifier::failing_with(vec![ActivityError::transient("busy"); 5]));
    let activities = register_activities(ActivityRegistry::builder(), queue.clone(), admin.clone(), queue).build();
    let retry = RetryPolicy::new(5)
        .with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(300),
        })
        .with_jitter(0.0);
    let rt = Runtime::start(
        in_memory_store(),
        Arc::new(activities),
        blob_notifier_definition_with_retry(retry),
        fast_options(),
    )
    .await;
    let store = rt.store();

    let id = rt.create_typed(&photo()).await.unwrap();
    assert!(
        wait_for_history(
            &store,
            &id,
            |hist| hist.iter().any(|e| e.kind_name() == "ActivityFailed"),
            5_000
        )
        .await
    );
    assert!(rt.cancel(&id, "operator").await.unwrap());
    let snapshot = rt.wait_for_terminal(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Cancelled);

    // Past the backoff: the executor saw the request and made no second attempt.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let hist = store.read(&id).await.unwrap();
    assert_eq!(count_scheduled(&hist, NOTIFY_ADMIN), 1);
    assert_eq!(rt.in_flight_count(), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn client_cancel_is_applied_by_runtime() {
    let gate = Arc::new(Notify::new());
    let g = gate.clone();
    let h = start_notifier_with(in_memory_store(), RecordingNotifier::default(), move |b| {
        b.register(NOTIFY_ADMIN, move |_| {
            let g = g.clone();
            async move {
                g.notified().await;
                "true".to_string()
            }
        })
    })
    .await;
    let client = Client::new(h.store.clone());

    let id = client.start_typed(&photo()).await.unwrap();
    assert!(
        wait_for_history(
            &h.store,
            &id,
            |hist| hist.iter().any(|e| e.activity_name() == Some(NOTIFY_ADMIN)),
            5_000
        )
        .await
    );
    assert!(client.cancel_instance(&id, "user request").await.unwrap());
    assert!(!client.cancel_instance(&id, "user request").await.unwrap());

    let snapshot = client.wait_for_terminal(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Cancelled);
    gate.notify_one();
    h.rt.shutdown().await;
}

#[tokio::test]
async fn cancel_of_completed_instance_is_ignored() {
    let h = start_notifier(in_memory_store(), RecordingNotifier::default()).await;
    let id = h.rt.create_typed(&photo()).await.unwrap();
    h.rt.wait_for_terminal(&id, Duration::from_secs(5)).await.unwrap();

    assert!(!h.rt.cancel(&id, "too late").await.unwrap());
    let snapshot = h.rt.status(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert!(snapshot.history.iter().all(|e| e.kind_name() != "CancelRequested"));
    h.rt.shutdown().await;
}

#[tokio::test]
async fn cancel_of_unknown_instance_errors() {
    let h = start_notifier(in_memory_store(), RecordingNotifier::default()).await;
    assert!(h.rt.cancel("missing", "x").await.is_err());
    h.rt.shutdown().await;
}
