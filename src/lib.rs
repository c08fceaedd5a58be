//! Durable, replay-safe orchestration of blob-upload notification workflows.
//!
//! A workflow instance is driven by a fixed sequence of side-effecting
//! activities. Every scheduling decision and every activity outcome is
//! recorded in an append-only history, and the orchestration engine derives
//! its next decision purely by replaying that history. Instances therefore
//! survive process restarts, retry failed steps without re-running completed
//! ones, and always arrive at the same final result.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blobflow::notifier::{self, BlobDescriptor, InMemoryQueue, RecordingNotifier};
//! use blobflow::providers::in_memory::InMemoryHistoryStore;
//! use blobflow::runtime::{Runtime, RuntimeOptions};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(InMemoryQueue::default());
//! let activities = notifier::register_activities(
//!     blobflow::runtime::activity::ActivityRegistry::builder(),
//!     queue.clone(),
//!     Arc::new(RecordingNotifier::default()),
//!     queue,
//! )
//! .build();
//! let rt = Runtime::start(
//!     Arc::new(InMemoryHistoryStore::default()),
//!     Arc::new(activities),
//!     notifier::blob_notifier_definition(),
//!     RuntimeOptions::default(),
//! )
//! .await;
//! let blob = BlobDescriptor::new("photo.png", "https://x/photo.png");
//! let id = rt.create_typed(&blob).await?;
//! let snapshot = rt.wait_for_terminal(&id, std::time::Duration::from_secs(5)).await?;
//! println!("{:?} {:?}", snapshot.status, snapshot.output);
//! # Ok(()) }
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod notifier;
pub mod providers;
pub mod runtime;

pub use client::Client;
pub use runtime::activity::{ActivityError, ActivityRegistry};
pub use runtime::replay_engine::{Decision, OrchestrationDefinition, OrchestrationEngine};
pub use runtime::retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{Runtime, RuntimeOptions};

/// First sequence number assigned in every instance history.
pub const INITIAL_SEQUENCE_NUMBER: u64 = 1;

/// Output of one completed step, kept for the final summary and for failure reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub activity: String,
    pub result: String,
}

/// Classified failure detail. This is the only failure shape that reaches
/// instance status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ErrorDetails {
    /// Network/timeout class failure. Retried by the executor while attempts remain.
    TransientActivity { message: String },
    /// Failure that no retry can fix. Recorded immediately.
    PermanentActivity { message: String },
    /// Replayed decisions disagree with recorded history.
    ReplayMismatch { message: String },
    /// History read/append invariant violated (gap, bad attempt numbering, undecodable record).
    HistoryCorruption { message: String },
    /// A step ran out of attempts (or failed permanently). Earlier steps stay completed.
    WorkflowFailed {
        activity: String,
        attempt: u32,
        cause: Box<ErrorDetails>,
        completed: Vec<StepOutput>,
    },
}

impl ErrorDetails {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorDetails::TransientActivity { .. })
    }

    /// Fatal errors need operator intervention and are never resolved by replay.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorDetails::ReplayMismatch { .. } | ErrorDetails::HistoryCorruption { .. }
        )
    }

    /// Short category label, used in logs.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::TransientActivity { .. } => "transient",
            ErrorDetails::PermanentActivity { .. } => "permanent",
            ErrorDetails::ReplayMismatch { .. } => "replay_mismatch",
            ErrorDetails::HistoryCorruption { .. } => "history_corruption",
            ErrorDetails::WorkflowFailed { .. } => "workflow_failed",
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::TransientActivity { message } => format!("transient activity error: {message}"),
            ErrorDetails::PermanentActivity { message } => format!("permanent activity error: {message}"),
            ErrorDetails::ReplayMismatch { message } => format!("orchestration replay mismatch: {message}"),
            ErrorDetails::HistoryCorruption { message } => format!("history corruption: {message}"),
            ErrorDetails::WorkflowFailed {
                activity,
                attempt,
                cause,
                completed,
            } => {
                let done: Vec<&str> = completed.iter().map(|s| s.activity.as_str()).collect();
                format!(
                    "workflow failed at '{activity}' (attempt {attempt}): {}; completed steps: [{}]",
                    cause.display_message(),
                    done.join(", ")
                )
            }
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

/// What happened. Sequence number and timestamp live on [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ActivityScheduled {
        name: String,
        attempt: u32,
        max_attempts: u32,
        input: String,
    },
    ActivityCompleted {
        name: String,
        attempt: u32,
        result: String,
    },
    ActivityFailed {
        name: String,
        attempt: u32,
        details: ErrorDetails,
    },
    CancelRequested {
        reason: String,
    },
    InstanceCompleted {
        output: String,
    },
    InstanceFailed {
        details: ErrorDetails,
    },
    InstanceCancelled {
        reason: String,
    },
}

impl EventKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::CancelRequested { .. } => "CancelRequested",
            EventKind::InstanceCompleted { .. } => "InstanceCompleted",
            EventKind::InstanceFailed { .. } => "InstanceFailed",
            EventKind::InstanceCancelled { .. } => "InstanceCancelled",
        }
    }

    pub fn activity_name(&self) -> Option<&str> {
        match self {
            EventKind::ActivityScheduled { name, .. }
            | EventKind::ActivityCompleted { name, .. }
            | EventKind::ActivityFailed { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn attempt(&self) -> Option<u32> {
        match self {
            EventKind::ActivityScheduled { attempt, .. }
            | EventKind::ActivityCompleted { attempt, .. }
            | EventKind::ActivityFailed { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::InstanceCompleted { .. } | EventKind::InstanceFailed { .. } | EventKind::InstanceCancelled { .. }
        )
    }
}

/// One persisted history record. Sequence numbers are contiguous per instance
/// and define the replay order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub sequence_number: u64,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(sequence_number: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            sequence_number,
            timestamp_ms,
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.kind_name()
    }

    pub fn activity_name(&self) -> Option<&str> {
        self.kind.activity_name()
    }

    pub fn attempt(&self) -> Option<u32> {
        self.kind.attempt()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(InstanceStatus::Running),
            "Completed" => Some(InstanceStatus::Completed),
            "Failed" => Some(InstanceStatus::Failed),
            "Cancelled" => Some(InstanceStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of an instance: its record plus the full history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInstance {
    pub id: String,
    pub input: String,
    pub status: InstanceStatus,
    pub history: Vec<Event>,
    pub output: Option<String>,
    pub error: Option<ErrorDetails>,
}

impl WorkflowInstance {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Codec for typed payloads carried as strings in history.
pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<String, String>;
    fn decode<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String>;
}

/// JSON codec used for trigger inputs.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| e.to_string())
    }

    fn decode<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| e.to_string())
    }
}

/// Milliseconds since the unix epoch. A clock before the epoch reads as 0.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_flat_with_type_tag() {
        let ev = Event::new(
            3,
            42,
            EventKind::ActivityCompleted {
                name: "notify-admin".to_string(),
                attempt: 1,
                result: "true".to_string(),
            },
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "ActivityCompleted");
        assert_eq!(json["sequence_number"], 3);
        assert_eq!(json["name"], "notify-admin");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn workflow_failed_message_lists_completed_steps() {
        let err = ErrorDetails::WorkflowFailed {
            activity: "notify-admin".to_string(),
            attempt: 1,
            cause: Box::new(ErrorDetails::PermanentActivity {
                message: "invalid phone number".to_string(),
            }),
            completed: vec![StepOutput {
                activity: "publish-queue-message".to_string(),
                result: "true".to_string(),
            }],
        };
        let msg = err.display_message();
        assert!(msg.contains("notify-admin"));
        assert!(msg.contains("invalid phone number"));
        assert!(msg.contains("publish-queue-message"));
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(InstanceStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(InstanceStatus::parse("Paused"), None);
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
    }
}
