use crate::runtime::retry::RetryPolicy;
use crate::{ErrorDetails, Event, EventKind, StepOutput, WorkflowInstance};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds the final result from the instance input and the recorded step outputs.
/// Must be a pure function.
pub type Summarizer = Arc<dyn Fn(&str, &[StepOutput]) -> Result<String, String> + Send + Sync>;

/// One named step of an orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub activity: String,
    pub retry: RetryPolicy,
}

/// A fixed, ordered step sequence plus the summary function.
#[derive(Clone)]
pub struct OrchestrationDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    summarize: Summarizer,
}

impl std::fmt::Debug for OrchestrationDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl OrchestrationDefinition {
    pub fn builder(name: impl Into<String>) -> OrchestrationDefinitionBuilder {
        OrchestrationDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            default_retry: RetryPolicy::default(),
            summarize: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }
}

pub struct OrchestrationDefinitionBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    default_retry: RetryPolicy,
    summarize: Option<Summarizer>,
}

impl OrchestrationDefinitionBuilder {
    /// Retry policy for steps added with [`step`](Self::step) after this call.
    pub fn default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn step(mut self, activity: impl Into<String>) -> Self {
        let retry = self.default_retry.clone();
        self.steps.push(StepDefinition {
            activity: activity.into(),
            retry,
        });
        self
    }

    pub fn step_with_retry(mut self, activity: impl Into<String>, retry: RetryPolicy) -> Self {
        self.steps.push(StepDefinition {
            activity: activity.into(),
            retry,
        });
        self
    }

    pub fn summarize<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[StepOutput]) -> Result<String, String> + Send + Sync + 'static,
    {
        self.summarize = Some(Arc::new(f));
        self
    }

    /// Without a summarizer the result is the JSON array of step results.
    pub fn build(self) -> OrchestrationDefinition {
        let summarize = self.summarize.unwrap_or_else(|| {
            Arc::new(|_input: &str, outputs: &[StepOutput]| {
                let results: Vec<&str> = outputs.iter().map(|o| o.result.as_str()).collect();
                serde_json::to_string(&results).map_err(|e| e.to_string())
            })
        });
        OrchestrationDefinition {
            name: self.name,
            steps: self.steps,
            summarize,
        }
    }
}

/// One activity invocation as handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTask {
    pub name: String,
    pub input: String,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
}

/// An activity the instance is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingActivity {
    /// The attempt that is running, or the next one if a retry is pending.
    pub task: ActivityTask,
    /// Whether `ActivityScheduled` for `task.attempt` is already in history.
    pub scheduled: bool,
}

/// Next step for an instance, derived from its history alone.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ScheduleActivity(ActivityTask),
    Suspend(PendingActivity),
    Complete(String),
    Fail(ErrorDetails),
    Cancel(String),
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Decision::Complete(_) | Decision::Fail(_) | Decision::Cancel(_))
    }
}

enum StepReplay {
    NotStarted,
    Pending(PendingActivity),
    Completed(String),
    Failed { attempt: u32, cause: ErrorDetails },
}

/// Replays an orchestration definition against history.
///
/// `advance` is a pure function of the definition, the instance input and the
/// history: it performs no I/O and reads no clock, so the same history prefix
/// always yields the same [`Decision`].
#[derive(Debug, Clone)]
pub struct OrchestrationEngine {
    definition: OrchestrationDefinition,
}

impl OrchestrationEngine {
    pub fn new(definition: OrchestrationDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &OrchestrationDefinition {
        &self.definition
    }

    pub fn advance(&self, instance: &WorkflowInstance) -> Decision {
        self.advance_history(&instance.id, &instance.input, &instance.history)
    }

    pub fn advance_history(&self, instance_id: &str, input: &str, history: &[Event]) -> Decision {
        let decision = self.decide(input, history);
        let decision = reconcile_with_recorded_terminal(history, decision);
        match &decision {
            Decision::Fail(err) if err.is_fatal() => {
                warn!(instance_id = %instance_id, error = %err.display_message(), "replay rejected history");
            }
            _ => {
                debug!(
                    instance_id = %instance_id,
                    orchestration = %self.definition.name,
                    history_len = history.len(),
                    decision = ?decision,
                    "advanced orchestration"
                );
            }
        }
        decision
    }

    fn decide(&self, input: &str, history: &[Event]) -> Decision {
        for (idx, ev) in history.iter().enumerate() {
            let expected = crate::INITIAL_SEQUENCE_NUMBER + idx as u64;
            if ev.sequence_number != expected {
                return Decision::Fail(ErrorDetails::HistoryCorruption {
                    message: format!("expected sequence number {expected}, found {}", ev.sequence_number),
                });
            }
        }

        if let Some(reason) = history.iter().find_map(|e| match &e.kind {
            EventKind::InstanceCancelled { reason } => Some(reason.clone()),
            _ => None,
        }) {
            return Decision::Cancel(reason);
        }
        let cancel_requested = history.iter().find_map(|e| match &e.kind {
            EventKind::CancelRequested { reason } => Some(reason.clone()),
            _ => None,
        });

        let activity_events: Vec<&Event> = history.iter().filter(|e| e.activity_name().is_some()).collect();
        let mut cursor = 0usize;
        let mut completed: Vec<StepOutput> = Vec::with_capacity(self.definition.steps.len());

        for step in &self.definition.steps {
            let replay = match self.replay_step(step, input, &activity_events, &mut cursor) {
                Ok(r) => r,
                Err(err) => return Decision::Fail(err),
            };
            match replay {
                StepReplay::Completed(result) => completed.push(StepOutput {
                    activity: step.activity.clone(),
                    result,
                }),
                StepReplay::NotStarted => {
                    if let Some(reason) = cancel_requested {
                        return Decision::Cancel(reason);
                    }
                    return Decision::ScheduleActivity(task_for(step, input, 1, step.retry.max_attempts));
                }
                StepReplay::Pending(pending) => {
                    // In-flight work may finish; its result is recorded but not acted on.
                    if let Some(reason) = cancel_requested {
                        return Decision::Cancel(reason);
                    }
                    return Decision::Suspend(pending);
                }
                StepReplay::Failed { attempt, cause } => {
                    return Decision::Fail(ErrorDetails::WorkflowFailed {
                        activity: step.activity.clone(),
                        attempt,
                        cause: Box::new(cause),
                        completed,
                    });
                }
            }
        }

        if let Some(extra) = activity_events.get(cursor) {
            return Decision::Fail(ErrorDetails::ReplayMismatch {
                message: format!(
                    "history has activity '{}' at sequence {} beyond the last step of '{}'",
                    extra.activity_name().unwrap_or_default(),
                    extra.sequence_number,
                    self.definition.name
                ),
            });
        }

        match (self.definition.summarize)(input, &completed) {
            Ok(output) => Decision::Complete(output),
            Err(message) => Decision::Fail(ErrorDetails::WorkflowFailed {
                activity: "summarize".to_string(),
                attempt: 1,
                cause: Box::new(ErrorDetails::PermanentActivity { message }),
                completed,
            }),
        }
    }

    /// Consume the events of one step starting at `cursor`.
    fn replay_step(
        &self,
        step: &StepDefinition,
        input: &str,
        events: &[&Event],
        cursor: &mut usize,
    ) -> Result<StepReplay, ErrorDetails> {
        let mut last_attempt = 0u32;
        let mut max_attempts = step.retry.max_attempts;

        loop {
            let Some(ev) = events.get(*cursor) else {
                return Ok(if last_attempt == 0 {
                    StepReplay::NotStarted
                } else {
                    // Last attempt failed transiently; the executor owes the next one.
                    StepReplay::Pending(PendingActivity {
                        task: task_for(step, input, last_attempt + 1, max_attempts),
                        scheduled: false,
                    })
                });
            };

            let EventKind::ActivityScheduled {
                name,
                attempt,
                max_attempts: recorded_max,
                input: recorded_input,
            } = &ev.kind
            else {
                return Err(if ev.activity_name() == Some(step.activity.as_str()) {
                    corruption(format!(
                        "{} for '{}' at sequence {} has no matching schedule",
                        ev.kind_name(),
                        step.activity,
                        ev.sequence_number
                    ))
                } else {
                    mismatch(step, ev)
                });
            };

            if name != &step.activity {
                return Err(mismatch(step, ev));
            }
            if *attempt != last_attempt + 1 || *attempt > *recorded_max {
                return Err(corruption(format!(
                    "'{}' scheduled with attempt {attempt} (max {recorded_max}) at sequence {}, expected attempt {}",
                    step.activity,
                    ev.sequence_number,
                    last_attempt + 1
                )));
            }
            if recorded_input != input {
                return Err(ErrorDetails::ReplayMismatch {
                    message: format!(
                        "'{}' at sequence {} was scheduled with a different input",
                        step.activity, ev.sequence_number
                    ),
                });
            }
            last_attempt = *attempt;
            max_attempts = *recorded_max;
            *cursor += 1;

            let Some(outcome) = events.get(*cursor) else {
                return Ok(StepReplay::Pending(PendingActivity {
                    task: task_for(step, input, last_attempt, max_attempts),
                    scheduled: true,
                }));
            };
            match &outcome.kind {
                EventKind::ActivityCompleted { name, attempt, result }
                    if name == &step.activity && *attempt == last_attempt =>
                {
                    *cursor += 1;
                    return Ok(StepReplay::Completed(result.clone()));
                }
                EventKind::ActivityFailed { name, attempt, details }
                    if name == &step.activity && *attempt == last_attempt =>
                {
                    *cursor += 1;
                    if !details.is_retryable() || last_attempt >= max_attempts {
                        return Ok(StepReplay::Failed {
                            attempt: last_attempt,
                            cause: details.clone(),
                        });
                    }
                }
                _ => {
                    return Err(corruption(format!(
                        "expected outcome of '{}' attempt {last_attempt}, found {} at sequence {}",
                        step.activity,
                        outcome.kind_name(),
                        outcome.sequence_number
                    )));
                }
            }
        }
    }
}

fn task_for(step: &StepDefinition, input: &str, attempt: u32, max_attempts: u32) -> ActivityTask {
    let mut retry = step.retry.clone();
    retry.max_attempts = max_attempts;
    ActivityTask {
        name: step.activity.clone(),
        input: input.to_string(),
        attempt,
        max_attempts,
        retry,
    }
}

fn corruption(message: String) -> ErrorDetails {
    ErrorDetails::HistoryCorruption { message }
}

fn mismatch(step: &StepDefinition, found: &Event) -> ErrorDetails {
    ErrorDetails::ReplayMismatch {
        message: format!(
            "expected activity '{}' but history has {}('{}') at sequence {}",
            step.activity,
            found.kind_name(),
            found.activity_name().unwrap_or_default(),
            found.sequence_number
        ),
    }
}

/// A recorded terminal event must agree with what replay derives.
fn reconcile_with_recorded_terminal(history: &[Event], decision: Decision) -> Decision {
    let recorded = history.iter().find(|e| e.is_terminal());
    let Some(recorded) = recorded else {
        return decision;
    };
    if matches!(decision, Decision::Fail(ref e) if e.is_fatal()) {
        return decision;
    }
    let agrees = match (&recorded.kind, &decision) {
        (EventKind::InstanceCompleted { output }, Decision::Complete(derived)) => output == derived,
        (EventKind::InstanceFailed { details }, Decision::Fail(derived)) => details == derived,
        (EventKind::InstanceCancelled { reason }, Decision::Cancel(derived)) => reason == derived,
        _ => false,
    };
    if agrees {
        decision
    } else {
        Decision::Fail(ErrorDetails::ReplayMismatch {
            message: format!(
                "history records {} at sequence {} but replay derives {:?}",
                recorded.kind_name(),
                recorded.sequence_number,
                decision
            ),
        })
    }
}

#[path = "replay_engine_tests.rs"]
#[cfg(test)]
mod replay_engine_tests;
