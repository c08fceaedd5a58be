use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blobflow::notifier::{RecordingNotifier, DRAIN_QUEUE, NOTIFY_ADMIN, PUBLISH_QUEUE_MESSAGE};
use blobflow::providers::HistoryStore;
use blobflow::{EventKind, InstanceStatus};

mod common;
use common::*;

/// First process: notify-admin hangs forever, simulating a crash mid-attempt.
/// Second process over the same SQLite file re-runs that attempt and finishes.
#[tokio::test]
async fn instance_survives_restart_mid_activity() {
    let (store, _td, db_url) = create_sqlite_store_disk().await;

    let h1 = start_notifier_with(store.clone(), RecordingNotifier::default(), |b| {
        b.register(NOTIFY_ADMIN, |_| async move {
            futures::future::pending::<()>().await;
            "true".to_string()
        })
    })
    .await;
    h1.rt.create_with_id("upload-1", photo_input()).await.unwrap();
    assert!(
        wait_for_history(
            &store,
            "upload-1",
            |hist| hist.iter().any(|e| e.activity_name() == Some(NOTIFY_ADMIN)),
            5_000
        )
        .await
    );
    h1.rt.shutdown().await;
    drop(h1.store);
    drop(store);

    let store2 = reopen_sqlite(&db_url).await;
    let before = store2.read("upload-1").await.unwrap();
    assert_eq!(before.len(), 3);
    assert_eq!(
        store2.read_instance("upload-1").await.unwrap().unwrap().status,
        InstanceStatus::Running
    );

    let h2 = start_notifier(store2.clone(), RecordingNotifier::default()).await;
    let snapshot = h2
        .rt
        .wait_for_terminal("upload-1", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(snapshot.status, InstanceStatus::Completed);
    // The interrupted attempt is re-invoked without a second schedule record;
    // the completed publish step is not re-run.
    assert_eq!(count_scheduled(&snapshot.history, PUBLISH_QUEUE_MESSAGE), 1);
    assert_eq!(count_scheduled(&snapshot.history, NOTIFY_ADMIN), 1);
    assert_eq!(count_scheduled(&snapshot.history, DRAIN_QUEUE), 1);
    assert_eq!(snapshot.history[..3], before[..]);
    assert_eq!(h2.admin.sent().await.len(), 1);
    h2.rt.shutdown().await;
}

#[tokio::test]
async fn pending_retry_resumes_at_next_attempt_after_restart() {
    let (store, _td, db_url) = create_sqlite_store_disk().await;
    store
        .create_instance(&blobflow::providers::InstanceRecord::new("upload-2", photo_input()))
        .await
        .unwrap();
    // History as left by a process that died during the retry backoff.
    for kind in [
        EventKind::ActivityScheduled {
            name: PUBLISH_QUEUE_MESSAGE.to_string(),
            attempt: 1,
            max_attempts: 3,
            input: photo_input(),
        },
        EventKind::ActivityCompleted {
            name: PUBLISH_QUEUE_MESSAGE.to_string(),
            attempt: 1,
            result: "true".to_string(),
        },
        EventKind::ActivityScheduled {
            name: NOTIFY_ADMIN.to_string(),
            attempt: 1,
            max_attempts: 3,
            input: photo_input(),
        },
        EventKind::ActivityFailed {
            name: NOTIFY_ADMIN.to_string(),
            attempt: 1,
            details: blobflow::ErrorDetails::TransientActivity {
                message: "503".to_string(),
            },
        },
    ] {
        store.append("upload-2", kind).await.unwrap();
    }
    drop(store);

    let store = reopen_sqlite(&db_url).await;
    let h = start_notifier(store, RecordingNotifier::default()).await;
    let snapshot = h
        .rt
        .wait_for_terminal("upload-2", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(snapshot.status, InstanceStatus::Completed);
    let notify_attempts: Vec<u32> = snapshot
        .history
        .iter()
        .filter(|e| e.activity_name() == Some(NOTIFY_ADMIN))
        .filter_map(|e| e.attempt())
        .collect();
    assert_eq!(notify_attempts, vec![1, 1, 2, 2]);
    h.rt.shutdown().await;
}

#[tokio::test]
async fn completed_history_replays_without_invoking_activities() {
    let (store, _td, db_url) = create_sqlite_store_disk().await;
    let h1 = start_notifier(store, RecordingNotifier::default()).await;
    let id = h1.rt.create_typed(&photo()).await.unwrap();
    let first = h1.rt.wait_for_terminal(&id, Duration::from_secs(5)).await.unwrap();
    h1.rt.shutdown().await;

    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let store2 = reopen_sqlite(&db_url).await;
    let h2 = start_notifier_with(store2.clone(), RecordingNotifier::default(), move |b| {
        b.register(NOTIFY_ADMIN, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async move { "true".to_string() }
        })
    })
    .await;

    // A fresh engine derives the same terminal decision from the persisted history.
    let history = store2.read(&id).await.unwrap();
    let decision = blobflow::OrchestrationEngine::new(h2.rt.definition().clone()).advance_history(
        &id,
        &first.input,
        &history,
    );
    assert_eq!(decision, blobflow::Decision::Complete(first.output.clone().unwrap()));

    h2.rt.resume(&id).await.unwrap();
    assert_eq!(h2.rt.recover().await.unwrap(), 0);
    let second = h2.rt.status(&id).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    h2.rt.shutdown().await;
}
