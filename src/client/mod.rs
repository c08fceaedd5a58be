use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::providers::{HistoryStore, InstanceRecord, ProviderError};
use crate::runtime::status::{load_snapshot, wait_for_terminal};
use crate::runtime::{encode_input, request_cancel, WaitError};
use crate::{InstanceStatus, WorkflowInstance};

/// Thin client for control-plane operations.
///
/// The client talks to runtimes only through the shared [`HistoryStore`]:
/// it creates `Running` instance records and records cancel requests, and a
/// [`Runtime`](crate::Runtime) over the same store picks them up on its next
/// recovery pass.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    poll_interval: Duration,
}

impl Client {
    /// Create a client bound to a HistoryStore instance.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Polling interval used by [`wait_for_terminal`](Self::wait_for_terminal).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start an instance with string input. Returns the generated id.
    pub async fn start(&self, input: impl Into<String>) -> Result<String, ProviderError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.start_with_id(&id, input).await?;
        Ok(id)
    }

    /// Start an instance with a caller-chosen id.
    pub async fn start_with_id(&self, instance: &str, input: impl Into<String>) -> Result<(), ProviderError> {
        self.store.create_instance(&InstanceRecord::new(instance, input)).await?;
        info!(instance_id = %instance, "instance enqueued by client");
        Ok(())
    }

    /// Start an instance with typed input (serialized to JSON).
    pub async fn start_typed<In: Serialize>(&self, input: &In) -> Result<String, ProviderError> {
        self.start(encode_input(input)?).await
    }

    /// Request cancellation of a running instance.
    pub async fn cancel_instance(&self, instance: &str, reason: impl Into<String>) -> Result<bool, ProviderError> {
        request_cancel(self.store.as_ref(), instance, &reason.into()).await
    }

    /// Status, result and history of an instance. `None` if unknown.
    pub async fn get_status(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError> {
        load_snapshot(self.store.as_ref(), instance).await
    }

    /// Ids of instances in `status`, oldest first.
    pub async fn list_instances(&self, status: InstanceStatus) -> Result<Vec<String>, ProviderError> {
        self.store.list_instances_by_status(status).await
    }

    /// Poll until the instance reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_terminal(&self, instance: &str, timeout: Duration) -> Result<WorkflowInstance, WaitError> {
        wait_for_terminal(self.store.as_ref(), instance, timeout, self.poll_interval).await
    }
}
