use crate::{ErrorDetails, Event, EventKind, InstanceStatus};

pub mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// In-memory provider for tests and demos.
pub mod in_memory;
/// SQLite-backed provider; the durable checkpoint medium.
pub mod sqlite;

/// Instance record kept next to the history: identity, input and the status
/// derived from the last terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub input: String,
    pub status: InstanceStatus,
    pub output: Option<String>,
    pub error: Option<ErrorDetails>,
    pub created_at_ms: u64,
}

impl InstanceRecord {
    /// A fresh `Running` record with no output.
    pub fn new(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            status: InstanceStatus::Running,
            output: None,
            error: None,
            created_at_ms: crate::now_millis(),
        }
    }
}

/// Storage abstraction for append-only workflow history per instance.
///
/// Implementations must assign sequence numbers atomically at append time
/// (1, 2, 3, ... per instance) and serialize concurrent appends for the same
/// instance. Events are never rewritten or reordered.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short provider name, used in logs.
    fn name(&self) -> &str;

    /// Create a new instance with an empty history. Fails if the id exists.
    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError>;

    /// Append one event and return the sequence number assigned to it.
    async fn append(&self, instance: &str, kind: EventKind) -> Result<u64, ProviderError>;

    /// Read the full ordered history. A gap in sequence numbers or an
    /// undecodable record is reported as a corruption error.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Read the instance record, `None` if unknown.
    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Record the terminal (or any) status transition.
    async fn update_status(
        &self,
        instance: &str,
        status: InstanceStatus,
        output: Option<String>,
        error: Option<ErrorDetails>,
    ) -> Result<(), ProviderError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Enumerate instances currently in `status`.
    async fn list_instances_by_status(&self, status: InstanceStatus) -> Result<Vec<String>, ProviderError>;

    /// Remove an instance and its history (archival hook).
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;
}

/// Check that `events` carry contiguous sequence numbers starting at 1.
pub(crate) fn validate_sequence(instance: &str, events: &[Event]) -> Result<(), ProviderError> {
    for (idx, ev) in events.iter().enumerate() {
        let expected = crate::INITIAL_SEQUENCE_NUMBER + idx as u64;
        if ev.sequence_number != expected {
            return Err(ProviderError::corruption(
                "read",
                format!(
                    "instance '{instance}': expected sequence number {expected}, found {}",
                    ev.sequence_number
                ),
            ));
        }
    }
    Ok(())
}
