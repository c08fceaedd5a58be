use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::providers::{HistoryStore, InstanceRecord, ProviderError};
use crate::{Codec, EventKind, InstanceStatus, Json};

pub mod activity;
pub mod executor;
pub mod observability;
pub mod replay_engine;
pub mod retry;
pub(crate) mod status;

pub use status::WaitError;

use activity::ActivityRegistry;
use executor::{ActivityExecutor, InFlightRegistry};
use observability::LoggingConfig;
use replay_engine::{ActivityTask, Decision, OrchestrationDefinition, OrchestrationEngine};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// How often `wait_for_terminal` re-reads instance status.
    /// Default: 10ms
    pub status_poll_interval: Duration,
    /// How often Running instances are re-examined. This re-dispatches attempts
    /// whose outcome was never recorded and picks up instances created or
    /// cancelled through a [`Client`](crate::Client).
    /// Default: 1s
    pub recovery_poll_interval: Duration,
    /// Install a global tracing subscriber at start. `None` leaves logging to the host.
    pub logging: Option<LoggingConfig>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_millis(10),
            recovery_poll_interval: Duration::from_secs(1),
            logging: None,
        }
    }
}

/// Append with exponential backoff (10ms, 20ms, ...) on retryable store errors.
pub(crate) async fn append_with_retry(
    store: &dyn HistoryStore,
    instance: &str,
    kind: EventKind,
    operation_tag: &str,
) -> Result<u64, ProviderError> {
    let mut attempts: u32 = 0;
    let max_attempts: u32 = 5;

    loop {
        match store.append(instance, kind.clone()).await {
            Ok(seq) => {
                debug!(instance_id = %instance, seq, "{} succeeded", operation_tag);
                return Ok(seq);
            }
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                let backoff_ms = 10u64.saturating_mul(1 << attempts);
                warn!(instance_id = %instance, attempts, backoff_ms, error = %e, "{} failed; retrying", operation_tag);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempts += 1;
            }
            Err(e) => {
                error!(instance_id = %instance, attempts, error = %e, "Failed to {}", operation_tag);
                return Err(e);
            }
        }
    }
}

/// Record a cancel request unless the instance is terminal or already has one.
/// Returns whether a `CancelRequested` event was appended.
pub(crate) async fn request_cancel(store: &dyn HistoryStore, instance: &str, reason: &str) -> Result<bool, ProviderError> {
    let Some(record) = store.read_instance(instance).await? else {
        return Err(ProviderError::permanent(
            "cancel",
            format!("instance not found: {instance}"),
        ));
    };
    if record.status.is_terminal() {
        debug!(instance_id = %instance, status = %record.status, "cancel ignored; instance is terminal");
        return Ok(false);
    }
    let history = store.read(instance).await?;
    if history
        .iter()
        .any(|e| matches!(e.kind, EventKind::CancelRequested { .. }))
    {
        return Ok(false);
    }
    append_with_retry(
        store,
        instance,
        EventKind::CancelRequested {
            reason: reason.to_string(),
        },
        "record_cancel_requested",
    )
    .await?;
    info!(instance_id = %instance, reason, "cancel requested");
    Ok(true)
}

pub(crate) fn encode_input<T: Serialize>(input: &T) -> Result<String, ProviderError> {
    Json::encode(input).map_err(|e| ProviderError::permanent("encode_input", e))
}

/// The instance manager: creates instances, re-enters the orchestration
/// engine whenever an activity finishes, and applies its decisions.
///
/// Every instance has exactly one writer at a time; [`resume`](Runtime::resume)
/// holds a per-instance lock for its whole read-decide-apply cycle.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn HistoryStore>,
    engine: OrchestrationEngine,
    executor: Arc<ActivityExecutor>,
    in_flight: InFlightRegistry,
    instance_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime: spawn the completion dispatcher and the recovery
    /// poller, then resume every instance that is still Running.
    pub async fn start(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        definition: OrchestrationDefinition,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if let Some(config) = &options.logging {
            // Tolerated: tests and multi-runtime processes install one subscriber.
            if let Err(e) = observability::init_logging(config) {
                debug!(error = %e, "logging already initialized");
            }
        }

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(ActivityExecutor::new(store.clone(), activities, completion_tx));

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            store,
            engine: OrchestrationEngine::new(definition),
            executor,
            in_flight: InFlightRegistry::default(),
            instance_locks: Mutex::new(HashMap::new()),
            options,
        });

        let handle = runtime.clone().start_completion_dispatcher(completion_rx);
        runtime.joins.lock().await.push(handle);

        let handle = runtime.clone().start_recovery_poller();
        runtime.joins.lock().await.push(handle);

        debug!(
            store = runtime.store.name(),
            orchestration = runtime.engine.definition().name(),
            "runtime started"
        );
        if let Err(e) = runtime.recover().await {
            error!(error = %e, "initial recovery pass failed");
        }
        runtime
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub fn definition(&self) -> &OrchestrationDefinition {
        self.engine.definition()
    }

    /// Number of activity attempts currently in flight in this process.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn start_completion_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(instance) = rx.recv().await {
                let rt = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = rt.resume(&instance).await {
                        error!(instance_id = %instance, error = %e, "resume after activity completion failed");
                    }
                });
            }
        })
    }

    fn start_recovery_poller(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.options.recovery_poll_interval).await;
                if let Err(e) = self.recover().await {
                    warn!(error = %e, "recovery pass failed");
                }
            }
        })
    }

    /// Create an instance with a fresh UUID and start it.
    pub async fn create(&self, input: impl Into<String>) -> Result<String, ProviderError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_with_id(&id, input).await?;
        Ok(id)
    }

    /// Create an instance with a caller-chosen id. Fails if the id exists.
    pub async fn create_with_id(&self, instance: &str, input: impl Into<String>) -> Result<(), ProviderError> {
        let record = InstanceRecord::new(instance, input);
        self.store.create_instance(&record).await?;
        info!(instance_id = %instance, orchestration = self.engine.definition().name(), "instance created");
        self.resume(instance).await
    }

    /// Create an instance whose input is `input` serialized to JSON.
    pub async fn create_typed<T: Serialize>(&self, input: &T) -> Result<String, ProviderError> {
        self.create(encode_input(input)?).await
    }

    async fn instance_lock(&self, instance: &str) -> Arc<Mutex<()>> {
        let mut locks = self.instance_locks.lock().await;
        locks.entry(instance.to_string()).or_default().clone()
    }

    async fn release_instance_lock(&self, instance: &str) {
        self.instance_locks.lock().await.remove(instance);
    }

    /// Re-enter the engine for `instance` and apply its decision.
    ///
    /// No-op for unknown or terminal instances, and safe to call any number
    /// of times: an attempt already in flight is never dispatched twice.
    pub async fn resume(&self, instance: &str) -> Result<(), ProviderError> {
        let lock = self.instance_lock(instance).await;
        let guard = lock.lock().await;

        let Some(record) = self.store.read_instance(instance).await? else {
            debug!(instance_id = %instance, "resume ignored; unknown instance");
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        let history = match self.store.read(instance).await {
            Ok(history) => history,
            Err(e) if e.is_corruption() => {
                let details = e.to_error_details();
                warn!(instance_id = %instance, error = %details, "history unreadable; failing instance");
                self.store
                    .update_status(instance, InstanceStatus::Failed, None, Some(details))
                    .await?;
                drop(guard);
                self.release_instance_lock(instance).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let recorded_terminal = history.iter().any(|e| e.is_terminal());
        let decision = self.engine.advance_history(instance, &record.input, &history);
        let terminal = decision.is_terminal();
        self.apply(instance, decision, recorded_terminal, history.len()).await?;

        if terminal {
            drop(guard);
            self.release_instance_lock(instance).await;
        }
        Ok(())
    }

    async fn apply(
        &self,
        instance: &str,
        decision: Decision,
        recorded_terminal: bool,
        decided_at_len: usize,
    ) -> Result<(), ProviderError> {
        match decision {
            Decision::ScheduleActivity(task) => self.start_activity(instance, task, false, decided_at_len).await,
            Decision::Suspend(pending) => {
                self.start_activity(instance, pending.task, pending.scheduled, decided_at_len)
                    .await
            }
            Decision::Complete(output) => {
                if !recorded_terminal {
                    append_with_retry(
                        self.store.as_ref(),
                        instance,
                        EventKind::InstanceCompleted { output: output.clone() },
                        "record_instance_completed",
                    )
                    .await?;
                }
                self.store
                    .update_status(instance, InstanceStatus::Completed, Some(output), None)
                    .await?;
                info!(instance_id = %instance, "instance completed");
                Ok(())
            }
            Decision::Fail(details) => {
                // Mismatch and corruption are not appended: the history itself is suspect.
                if !details.is_fatal() && !recorded_terminal {
                    append_with_retry(
                        self.store.as_ref(),
                        instance,
                        EventKind::InstanceFailed {
                            details: details.clone(),
                        },
                        "record_instance_failed",
                    )
                    .await?;
                }
                warn!(
                    instance_id = %instance,
                    category = details.category(),
                    error = %details,
                    "instance failed"
                );
                self.store
                    .update_status(instance, InstanceStatus::Failed, None, Some(details))
                    .await?;
                Ok(())
            }
            Decision::Cancel(reason) => {
                if !recorded_terminal {
                    append_with_retry(
                        self.store.as_ref(),
                        instance,
                        EventKind::InstanceCancelled { reason: reason.clone() },
                        "record_instance_cancelled",
                    )
                    .await?;
                }
                self.store
                    .update_status(instance, InstanceStatus::Cancelled, None, None)
                    .await?;
                info!(instance_id = %instance, reason = %reason, "instance cancelled");
                Ok(())
            }
        }
    }

    /// Dispatch `task` unless an attempt of it is already in flight.
    ///
    /// The executor releases its marker only after recording an outcome, so a
    /// successful claim re-reads history: if it grew since the decision was
    /// taken, the decision is stale and the outcome's own resume takes over.
    async fn start_activity(
        &self,
        instance: &str,
        task: ActivityTask,
        already_scheduled: bool,
        decided_at_len: usize,
    ) -> Result<(), ProviderError> {
        let Some(guard) = self.in_flight.try_claim(instance, &task.name) else {
            debug!(instance_id = %instance, activity_name = %task.name, "attempt already in flight");
            return Ok(());
        };
        let current_len = self.store.read(instance).await?.len();
        if current_len != decided_at_len {
            debug!(
                instance_id = %instance,
                activity_name = %task.name,
                decided_at_len,
                current_len,
                "history moved since decision; not dispatching"
            );
            drop(guard);
            return Ok(());
        }
        debug!(
            instance_id = %instance,
            activity_name = %task.name,
            attempt = task.attempt,
            already_scheduled,
            "dispatching activity"
        );
        self.executor.dispatch(instance.to_string(), task, already_scheduled, guard);
        Ok(())
    }

    /// Request cooperative cancellation. Attempts already running finish;
    /// no new step or retry is scheduled afterwards.
    ///
    /// Returns `false` if the instance is terminal or a cancel was already requested.
    pub async fn cancel(&self, instance: &str, reason: &str) -> Result<bool, ProviderError> {
        let requested = {
            let lock = self.instance_lock(instance).await;
            let _guard = lock.lock().await;
            request_cancel(self.store.as_ref(), instance, reason).await?
        };
        self.resume(instance).await?;
        Ok(requested)
    }

    /// Resume every Running instance. Returns how many were examined.
    pub async fn recover(&self) -> Result<usize, ProviderError> {
        let running = self.store.list_instances_by_status(InstanceStatus::Running).await?;
        if running.is_empty() {
            return Ok(0);
        }
        debug!(count = running.len(), "recovering running instances");
        let results = join_all(running.iter().map(|id| self.resume(id))).await;
        for (id, result) in running.iter().zip(results) {
            if let Err(e) = result {
                warn!(instance_id = %id, error = %e, "recovery resume failed");
            }
        }
        Ok(running.len())
    }

    /// Abort background tasks. Activity attempts already dispatched are not
    /// awaited; their outcomes are picked up by the next runtime's recovery.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        debug!("runtime shut down");
    }
}
