use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::HistoryStore;
use crate::runtime::activity::{ActivityError, ActivityRegistry};
use crate::runtime::replay_engine::ActivityTask;
use crate::{ErrorDetails, EventKind};

/// Final result of running one activity task through its attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed { attempt: u32, result: String },
    /// Permanent failure, or the last attempt failed transiently.
    Failed { attempt: u32, details: ErrorDetails },
    /// A cancel request was seen between attempts; no further attempt was made.
    Abandoned { attempt: u32 },
    /// The store kept rejecting an append. The attempt is re-dispatched by recovery.
    Unrecorded { attempt: u32 },
}

impl ActivityOutcome {
    pub fn attempt(&self) -> u32 {
        match self {
            ActivityOutcome::Completed { attempt, .. }
            | ActivityOutcome::Failed { attempt, .. }
            | ActivityOutcome::Abandoned { attempt }
            | ActivityOutcome::Unrecorded { attempt } => *attempt,
        }
    }
}

type InFlightKey = (String, String);

/// Tracks `(instance, activity)` pairs with an attempt in flight in this process.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<HashSet<InFlightKey>>>,
}

impl InFlightRegistry {
    /// Claim the marker. `None` if another task already holds it.
    pub fn try_claim(&self, instance: &str, activity: &str) -> Option<InFlightGuard> {
        let key = (instance.to_string(), activity.to_string());
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            registry: self.inner.clone(),
            key,
        })
    }

    pub fn is_in_flight(&self, instance: &str, activity: &str) -> bool {
        let set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(&(instance.to_string(), activity.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the in-flight marker on drop.
pub struct InFlightGuard {
    registry: Arc<Mutex<HashSet<InFlightKey>>>,
    key: InFlightKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
    }
}

/// Runs activity tasks through the gateway and records every attempt.
///
/// Attempts are at-least-once: an attempt that succeeded remotely but whose
/// outcome was never recorded runs again after a restart.
pub struct ActivityExecutor {
    store: Arc<dyn HistoryStore>,
    activities: Arc<ActivityRegistry>,
    completions: mpsc::UnboundedSender<String>,
}

impl ActivityExecutor {
    /// `completions` receives the instance id after each final outcome.
    pub fn new(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        completions: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            store,
            activities,
            completions,
        }
    }

    /// Run `task` on a background task. The guard is held until the outcome is
    /// recorded, then released before the instance is notified.
    pub fn dispatch(
        self: &Arc<Self>,
        instance: String,
        task: ActivityTask,
        already_scheduled: bool,
        guard: InFlightGuard,
    ) -> JoinHandle<ActivityOutcome> {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.execute(&instance, task, already_scheduled).await;
            drop(guard);
            if this.completions.send(instance.clone()).is_err() {
                debug!(instance_id = %instance, "completion channel closed; runtime is shutting down");
            }
            outcome
        })
    }

    /// Run attempts of `task` starting at `task.attempt` until one completes,
    /// fails permanently, exhausts `max_attempts` or the instance is cancelled.
    ///
    /// `already_scheduled` means `ActivityScheduled` for `task.attempt` is
    /// already in history (crash recovery of an in-flight attempt).
    pub async fn execute(&self, instance: &str, task: ActivityTask, already_scheduled: bool) -> ActivityOutcome {
        let mut attempt = task.attempt;
        let mut scheduled = already_scheduled;

        loop {
            if !scheduled {
                let kind = EventKind::ActivityScheduled {
                    name: task.name.clone(),
                    attempt,
                    max_attempts: task.max_attempts,
                    input: task.input.clone(),
                };
                if super::append_with_retry(self.store.as_ref(), instance, kind, "record_scheduled").await.is_err() {
                    return ActivityOutcome::Unrecorded { attempt };
                }
            }
            scheduled = false;

            debug!(instance_id = %instance, activity_name = %task.name, attempt, "invoking activity");
            match self.invoke(&task).await {
                Ok(result) => {
                    let kind = EventKind::ActivityCompleted {
                        name: task.name.clone(),
                        attempt,
                        result: result.clone(),
                    };
                    if super::append_with_retry(self.store.as_ref(), instance, kind, "record_completed").await.is_err() {
                        return ActivityOutcome::Unrecorded { attempt };
                    }
                    debug!(instance_id = %instance, activity_name = %task.name, attempt, "activity completed");
                    return ActivityOutcome::Completed { attempt, result };
                }
                Err(err) => {
                    let details = err.to_error_details();
                    let kind = EventKind::ActivityFailed {
                        name: task.name.clone(),
                        attempt,
                        details: details.clone(),
                    };
                    if super::append_with_retry(self.store.as_ref(), instance, kind, "record_failed").await.is_err() {
                        return ActivityOutcome::Unrecorded { attempt };
                    }

                    if !err.is_retryable() || attempt >= task.max_attempts {
                        warn!(
                            instance_id = %instance,
                            activity_name = %task.name,
                            attempt,
                            max_attempts = task.max_attempts,
                            error = %err,
                            "activity failed"
                        );
                        return ActivityOutcome::Failed { attempt, details };
                    }

                    let delay = task.retry.delay_with_jitter(attempt);
                    warn!(
                        instance_id = %instance,
                        activity_name = %task.name,
                        attempt,
                        max_attempts = task.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "activity attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;

                    if self.cancel_requested(instance).await {
                        debug!(instance_id = %instance, activity_name = %task.name, attempt, "cancel requested; abandoning retries");
                        return ActivityOutcome::Abandoned { attempt };
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn invoke(&self, task: &ActivityTask) -> Result<String, ActivityError> {
        let call = self.activities.invoke(&task.name, task.input.clone());
        match task.retry.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ActivityError::transient(format!("timed out after {}ms", limit.as_millis()))),
            },
            None => call.await,
        }
    }

    async fn cancel_requested(&self, instance: &str) -> bool {
        match self.store.read(instance).await {
            Ok(history) => history
                .iter()
                .any(|e| matches!(e.kind, EventKind::CancelRequested { .. })),
            Err(e) => {
                warn!(instance_id = %instance, error = %e, "could not read history for cancel check");
                false
            }
        }
    }
}
