//! The blob-upload notification workflow.
//!
//! An uploaded blob triggers three steps, each a gateway activity that
//! receives the instance input (the serialized [`BlobDescriptor`]):
//!
//! 1. `publish-queue-message` - publish the blob record to the notification queue
//! 2. `notify-admin` - tell an administrator about the upload
//! 3. `drain-queue` - receive, process and acknowledge everything on the queue
//!
//! A step starts only after the previous one completed. The final result is a
//! one-line summary naming the blob.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime::activity::{ActivityError, ActivityRegistryBuilder};
use crate::runtime::replay_engine::OrchestrationDefinition;
use crate::runtime::retry::RetryPolicy;
use crate::{Codec, Json, StepOutput};

mod collaborators;

pub use collaborators::{
    AdminNotifier, InMemoryQueue, MessagePublisher, QueueConsumer, ReceivedMessage, RecordingNotifier,
};

pub const ORCHESTRATION_NAME: &str = "blob-notifier";
pub const PUBLISH_QUEUE_MESSAGE: &str = "publish-queue-message";
pub const NOTIFY_ADMIN: &str = "notify-admin";
pub const DRAIN_QUEUE: &str = "drain-queue";

/// Messages received per `receive_batch` call while draining.
pub const DRAIN_BATCH_SIZE: usize = 16;

/// Record of an uploaded object, as delivered by the storage trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub name: String,
    #[serde(rename = "blobUrl")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Storage-side blob kind, e.g. `BlockBlob`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, rename = "eTag", skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BlobDescriptor {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            size: None,
            content_type: None,
            file_type: None,
            etag: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn decode_blob(input: &str) -> Result<BlobDescriptor, ActivityError> {
    Json::decode(input).map_err(|e| ActivityError::permanent(format!("invalid blob descriptor: {e}")))
}

fn bool_result(ok: bool) -> String {
    ok.to_string()
}

/// The three-step definition with the default retry policy.
pub fn blob_notifier_definition() -> OrchestrationDefinition {
    blob_notifier_definition_with_retry(RetryPolicy::default())
}

/// The three-step definition with `retry` on every step.
pub fn blob_notifier_definition_with_retry(retry: RetryPolicy) -> OrchestrationDefinition {
    OrchestrationDefinition::builder(ORCHESTRATION_NAME)
        .default_retry(retry)
        .step(PUBLISH_QUEUE_MESSAGE)
        .step(NOTIFY_ADMIN)
        .step(DRAIN_QUEUE)
        .summarize(summarize)
        .build()
}

/// `blob '<name>' (<url>): queued=<b>, admin_notified=<b>, queue_drained=<b>`
pub fn summarize(input: &str, outputs: &[StepOutput]) -> Result<String, String> {
    let blob: BlobDescriptor = Json::decode(input)?;
    let flag = |activity: &str| {
        outputs
            .iter()
            .find(|o| o.activity == activity)
            .map(|o| o.result == "true")
            .unwrap_or(false)
    };
    Ok(format!(
        "blob '{}' ({}): queued={}, admin_notified={}, queue_drained={}",
        blob.name,
        blob.url,
        flag(PUBLISH_QUEUE_MESSAGE),
        flag(NOTIFY_ADMIN),
        flag(DRAIN_QUEUE)
    ))
}

/// Register the three notifier activities on `builder`.
pub fn register_activities(
    builder: ActivityRegistryBuilder,
    publisher: Arc<dyn MessagePublisher>,
    notifier: Arc<dyn AdminNotifier>,
    consumer: Arc<dyn QueueConsumer>,
) -> ActivityRegistryBuilder {
    builder
        .register_result(PUBLISH_QUEUE_MESSAGE, move |input: String| {
            let publisher = publisher.clone();
            async move { publish_queue_message(publisher.as_ref(), &input).await }
        })
        .register_result(NOTIFY_ADMIN, move |input: String| {
            let notifier = notifier.clone();
            async move { notify_admin(notifier.as_ref(), &input).await }
        })
        .register_result(DRAIN_QUEUE, move |input: String| {
            let consumer = consumer.clone();
            async move { drain_queue(consumer.as_ref(), &input).await }
        })
}

async fn publish_queue_message(publisher: &dyn MessagePublisher, input: &str) -> Result<String, ActivityError> {
    let blob = decode_blob(input)?;
    let body = Json::encode(&blob).map_err(ActivityError::permanent)?;
    publisher.publish(&body).await?;
    debug!(blob = %blob.name, "published blob notification message");
    Ok(bool_result(true))
}

async fn notify_admin(notifier: &dyn AdminNotifier, input: &str) -> Result<String, ActivityError> {
    let blob = decode_blob(input)?;
    let message = match blob.size {
        Some(size) => format!("New blob uploaded: {} ({} bytes) at {}", blob.name, size, blob.url),
        None => format!("New blob uploaded: {} at {}", blob.name, blob.url),
    };
    notifier.notify(&message).await?;
    debug!(blob = %blob.name, "admin notified");
    Ok(bool_result(true))
}

/// Receive batches until the queue is empty. A message that cannot be
/// processed is abandoned and the pass stops with `"false"` so it is not
/// received again in a tight loop. If the queue itself errors mid-batch, the
/// batch's unsettled messages are abandoned before the error is returned.
async fn drain_queue(consumer: &dyn QueueConsumer, input: &str) -> Result<String, ActivityError> {
    let trigger = decode_blob(input)?;
    let mut processed = 0usize;
    loop {
        let batch = consumer.receive_batch(DRAIN_BATCH_SIZE).await?;
        if batch.is_empty() {
            break;
        }
        let mut abandoned = 0usize;
        for (i, msg) in batch.iter().enumerate() {
            match settle(consumer, msg).await {
                Ok(true) => processed += 1,
                Ok(false) => abandoned += 1,
                Err(e) => {
                    release_locks(consumer, &batch[i..]).await;
                    return Err(e);
                }
            }
        }
        if abandoned > 0 {
            debug!(trigger = %trigger.name, processed, abandoned, "queue not fully drained");
            return Ok(bool_result(false));
        }
    }
    debug!(trigger = %trigger.name, processed, "queue drained");
    Ok(bool_result(true))
}

/// Complete `msg` if it decodes, abandon it otherwise. `Ok(true)` when completed.
async fn settle(consumer: &dyn QueueConsumer, msg: &ReceivedMessage) -> Result<bool, ActivityError> {
    match Json::decode::<BlobDescriptor>(&msg.body) {
        Ok(blob) => {
            info!(blob = %blob.name, url = %blob.url, delivery_count = msg.delivery_count, "processing queued blob notification");
            consumer.complete(&msg.lock_token).await?;
            Ok(true)
        }
        Err(e) => {
            warn!(lock_token = %msg.lock_token, error = %e, "abandoning unprocessable queue message");
            consumer.abandon(&msg.lock_token).await?;
            Ok(false)
        }
    }
}

/// Best-effort abandon of `msgs`, last first so they reappear in received order.
async fn release_locks(consumer: &dyn QueueConsumer, msgs: &[ReceivedMessage]) {
    for msg in msgs.iter().rev() {
        if let Err(e) = consumer.abandon(&msg.lock_token).await {
            warn!(lock_token = %msg.lock_token, error = %e, "failed to release queue message lock");
        }
    }
}
