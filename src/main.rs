use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blobflow::notifier::{self, BlobDescriptor, InMemoryQueue, RecordingNotifier};
use blobflow::providers::in_memory::InMemoryHistoryStore;
use blobflow::providers::sqlite::SqliteHistoryStore;
use blobflow::providers::HistoryStore;
use blobflow::runtime::observability::LoggingConfig;
use blobflow::{ActivityRegistry, Runtime, RuntimeOptions};

/// Runs one upload trigger end to end and prints the instance history.
///
/// `BLOBFLOW_DB` selects a SQLite database (e.g. `sqlite:blobflow.db`);
/// without it the history lives in memory. Instances left Running by an
/// earlier run against the same database are resumed first.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store: Arc<dyn HistoryStore> = match std::env::var("BLOBFLOW_DB") {
        Ok(url) => Arc::new(
            SqliteHistoryStore::new(&url)
                .await
                .with_context(|| format!("opening {url}"))?,
        ),
        Err(_) => Arc::new(InMemoryHistoryStore::default()),
    };

    let queue = Arc::new(InMemoryQueue::default());
    let admin = Arc::new(RecordingNotifier::default());
    let activities = notifier::register_activities(ActivityRegistry::builder(), queue.clone(), admin.clone(), queue.clone()).build();

    let options = RuntimeOptions {
        logging: Some(LoggingConfig::default()),
        ..Default::default()
    };
    let rt = Runtime::start(store, Arc::new(activities), notifier::blob_notifier_definition(), options).await;

    let blob = BlobDescriptor::new("photo.png", "https://x/photo.png")
        .with_size(2048)
        .with_content_type("image/png")
        .with_file_type("BlockBlob");
    let id = rt.create_typed(&blob).await.context("creating instance")?;
    let snapshot = rt
        .wait_for_terminal(&id, Duration::from_secs(30))
        .await
        .context("waiting for instance")?;

    println!("instance {id}: {}", snapshot.status);
    for ev in &snapshot.history {
        println!(
            "  #{} {} {}",
            ev.sequence_number,
            ev.kind_name(),
            ev.activity_name().unwrap_or_default()
        );
    }
    match (&snapshot.output, &snapshot.error) {
        (Some(output), _) => println!("result: {output}"),
        (None, Some(error)) => println!("error: {error}"),
        (None, None) => {}
    }
    println!("admin messages: {:?}", admin.sent().await);

    rt.shutdown().await;
    Ok(())
}
