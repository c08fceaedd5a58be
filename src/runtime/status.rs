use std::time::Duration;

use crate::providers::{HistoryStore, ProviderError};
use crate::WorkflowInstance;

/// Error type returned by the wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    NotFound,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for a terminal status"),
            WaitError::NotFound => f.write_str("instance not found"),
            WaitError::Other(msg) => write!(f, "wait failed: {msg}"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<ProviderError> for WaitError {
    fn from(e: ProviderError) -> Self {
        WaitError::Other(e.to_string())
    }
}

/// Record plus history. A Failed instance whose history cannot be decoded is
/// returned with an empty history; its `error` already names the corruption.
pub(crate) async fn load_snapshot(
    store: &dyn HistoryStore,
    instance: &str,
) -> Result<Option<WorkflowInstance>, ProviderError> {
    let Some(record) = store.read_instance(instance).await? else {
        return Ok(None);
    };
    let history = match store.read(instance).await {
        Ok(history) => history,
        Err(e) if e.is_corruption() && record.status.is_terminal() => Vec::new(),
        Err(e) => return Err(e),
    };
    Ok(Some(WorkflowInstance {
        id: record.id,
        input: record.input,
        status: record.status,
        history,
        output: record.output,
        error: record.error,
    }))
}

/// Poll `instance` every `poll` until it is terminal or `timeout` elapses.
pub(crate) async fn wait_for_terminal(
    store: &dyn HistoryStore,
    instance: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<WorkflowInstance, WaitError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match store.read_instance(instance).await? {
            None => return Err(WaitError::NotFound),
            Some(record) if record.status.is_terminal() => {
                return load_snapshot(store, instance).await?.ok_or(WaitError::NotFound);
            }
            Some(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WaitError::Timeout);
        }
        tokio::time::sleep(poll).await;
    }
}

impl super::Runtime {
    /// Snapshot of an instance: status, result and full history. `None` if unknown.
    pub async fn status(&self, instance: &str) -> Result<Option<WorkflowInstance>, ProviderError> {
        load_snapshot(self.store.as_ref(), instance).await
    }

    /// Wait until `instance` reaches `Completed`, `Failed` or `Cancelled`.
    pub async fn wait_for_terminal(&self, instance: &str, timeout: Duration) -> Result<WorkflowInstance, WaitError> {
        wait_for_terminal(self.store.as_ref(), instance, timeout, self.options.status_poll_interval).await
    }
}
