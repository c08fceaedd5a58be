#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use blobflow::notifier::{self, BlobDescriptor, InMemoryQueue, RecordingNotifier};
use blobflow::providers::in_memory::InMemoryHistoryStore;
use blobflow::providers::sqlite::SqliteHistoryStore;
use blobflow::providers::HistoryStore;
use blobflow::runtime::activity::ActivityRegistryBuilder;
use blobflow::{ActivityRegistry, BackoffStrategy, Event, RetryPolicy, Runtime, RuntimeOptions};
use tempfile::TempDir;

pub fn photo() -> BlobDescriptor {
    BlobDescriptor::new("photo.png", "https://x/photo.png")
}

pub fn photo_input() -> String {
    serde_json::to_string(&photo()).unwrap()
}

/// Three attempts, no backoff, no jitter.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3).with_backoff(BackoffStrategy::None).with_jitter(0.0)
}

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        status_poll_interval: Duration::from_millis(5),
        recovery_poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// The notifier collaborators plus a runtime wired to them.
pub struct Harness {
    pub rt: Arc<Runtime>,
    pub store: Arc<dyn HistoryStore>,
    pub queue: Arc<InMemoryQueue>,
    pub admin: Arc<RecordingNotifier>,
}

pub async fn start_notifier(store: Arc<dyn HistoryStore>, admin: RecordingNotifier) -> Harness {
    start_notifier_with(store, admin, |b| b).await
}

/// Like [`start_notifier`], with `extend` applied to the registry builder last
/// (registering the same name again replaces a notifier activity).
pub async fn start_notifier_with<F>(store: Arc<dyn HistoryStore>, admin: RecordingNotifier, extend: F) -> Harness
where
    F: FnOnce(ActivityRegistryBuilder) -> ActivityRegistryBuilder,
{
    let queue = Arc::new(InMemoryQueue::default());
    let admin = Arc::new(admin);
    let builder = notifier::register_activities(ActivityRegistry::builder(), queue.clone(), admin.clone(), queue.clone());
    let activities = extend(builder).build();
    let rt = Runtime::start(
        store.clone(),
        Arc::new(activities),
        notifier::blob_notifier_definition_with_retry(fast_retry()),
        fast_options(),
    )
    .await;
    Harness { rt, store, queue, admin }
}

pub fn in_memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::default())
}

pub async fn sqlite_memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(SqliteHistoryStore::new_in_memory().await.unwrap())
}

/// A SQLite file in a temp dir. Keep the `TempDir` alive for the test.
pub async fn create_sqlite_store_disk() -> (Arc<dyn HistoryStore>, TempDir, String) {
    let td = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite:{}", td.path().join("test.db").display());
    let store = Arc::new(SqliteHistoryStore::new(&db_url).await.unwrap()) as Arc<dyn HistoryStore>;
    (store, td, db_url)
}

pub async fn reopen_sqlite(db_url: &str) -> Arc<dyn HistoryStore> {
    Arc::new(SqliteHistoryStore::new(db_url).await.unwrap())
}

pub async fn wait_for_history<F>(store: &Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await {
            if predicate(&hist) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// `(kind, activity)` pairs, for asserting event sequences.
pub fn shape(history: &[Event]) -> Vec<(&'static str, Option<String>)> {
    history
        .iter()
        .map(|e| (e.kind_name(), e.activity_name().map(str::to_string)))
        .collect()
}

pub fn ev(kind: &'static str, activity: Option<&str>) -> (&'static str, Option<String>) {
    (kind, activity.map(str::to_string))
}

pub fn count_scheduled(history: &[Event], activity: &str) -> usize {
    history
        .iter()
        .filter(|e| e.kind_name() == "ActivityScheduled" && e.activity_name() == Some(activity))
        .count()
}
