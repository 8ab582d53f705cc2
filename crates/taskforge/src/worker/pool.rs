//! Worker pool for task execution
//!
//! Runs persisted and ephemeral work side by side. Capacity is reserved
//! before dispatch (the caller hands over a [`CapacityPermit`]), so the
//! pool itself only enforces timeouts, records results and releases the
//! permit when a run ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::capacity::CapacityPermit;
use super::managed::ManagedConfiguration;
use crate::monitoring::{FailureKind, RunOutcome, TaskEvent};
use crate::persistence::{ClaimedTask, Completion, StoreError, TaskStore};
use crate::task::{
    RetryDirective, TaskContext, TaskDefinition, TaskDocument, TaskRunError, TaskRunResult,
};

/// How long a timed-out runner gets to acknowledge `cancel`
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// An ephemeral run ready for dispatch
pub struct EphemeralWork {
    pub id: String,
    pub definition: Arc<TaskDefinition>,
    pub params: Value,
    pub run_state: Value,
    pub permit: CapacityPermit,
    pub responder: oneshot::Sender<RunOutcome>,
}

impl std::fmt::Debug for EphemeralWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralWork")
            .field("id", &self.id)
            .field("task_type", &self.definition.task_type)
            .finish()
    }
}

/// Schedulable work: the two lanes differ only in how results are recorded
#[derive(Debug)]
pub enum Work {
    /// Claimed from the store; the result is written back to it
    Persisted(ClaimedTask),
    /// Never persisted; the result resolves the caller's handle
    Ephemeral(EphemeralWork),
}

impl Work {
    pub fn task_id(&self) -> &str {
        match self {
            Work::Persisted(claimed) => &claimed.task.id,
            Work::Ephemeral(work) => &work.id,
        }
    }

    pub fn task_type(&self) -> &str {
        match self {
            Work::Persisted(claimed) => &claimed.definition.task_type,
            Work::Ephemeral(work) => &work.definition.task_type,
        }
    }
}

/// How one execution ended
enum Execution {
    Completed(TaskRunResult),
    Errored(TaskRunError),
    TimedOut,
    /// Abandoned because shutdown ran out of time
    Aborted,
}

/// Result of draining the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Runs still in flight when the timeout hit; they were cancelled
    pub abandoned: usize,
}

struct PoolInner {
    tasks: Arc<TaskStore>,
    managed: Arc<ManagedConfiguration>,
    events: broadcast::Sender<TaskEvent>,
    abort: CancellationToken,
}

/// Executor shared by the polling and ephemeral lifecycles
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        tasks: Arc<TaskStore>,
        managed: Arc<ManagedConfiguration>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                tasks,
                managed,
                events,
                abort: CancellationToken::new(),
            }),
            tracker: TaskTracker::new(),
        }
    }

    /// Start running `work` in the background
    ///
    /// Dispatch order is preserved; completion order is not.
    pub fn dispatch(&self, work: Work) {
        let inner = Arc::clone(&self.inner);
        let span = tracing::debug_span!(
            "task_run",
            task_id = %work.task_id(),
            task_type = %work.task_type()
        );

        match work {
            Work::Persisted(claimed) => {
                self.tracker
                    .spawn(async move { inner.run_persisted(claimed).await }.instrument(span));
            }
            Work::Ephemeral(work) => {
                self.tracker
                    .spawn(async move { inner.run_ephemeral(work).await }.instrument(span));
            }
        }
    }

    /// Number of runs in flight
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for in-flight runs, cancelling whatever is left after `timeout`
    #[instrument(skip(self))]
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
        {
            debug!("All runs completed");
            return DrainReport { abandoned: 0 };
        }

        let abandoned = self.tracker.len();
        warn!(abandoned, "Shutdown timeout reached, cancelling remaining runs");
        self.inner.abort.cancel();
        // Cancelled runs return promptly once their futures are dropped
        if tokio::time::timeout(CANCEL_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                still_running = self.tracker.len(),
                grace_ms = CANCEL_GRACE.as_millis() as u64,
                "Runs did not stop within the cancellation grace period"
            );
        }
        DrainReport { abandoned }
    }

    /// Fail a claimed task whose type is not registered
    pub async fn fail_unrecognized(&self, mut task: TaskDocument) {
        let error = format!("unknown task type: {}", task.task_type);
        warn!(task_id = %task.id, task_type = %task.task_type, "Claimed task has unknown type");

        if let Err(e) = self.inner.tasks.mark_failed(&mut task, &error, None).await {
            self.inner.report_store_error(&task.id, &e);
        }

        self.inner.emit(TaskEvent::TaskRunFailed {
            task_id: task.id,
            task_type: task.task_type,
            ephemeral: false,
            error,
            kind: FailureKind::Validation,
            will_retry: false,
        });
    }
}

impl PoolInner {
    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report_store_error(&self, task_id: &str, error: &StoreError) {
        if error.is_conflict() {
            warn!(%task_id, "Task was taken over before its result was written");
        } else {
            error!(%task_id, error = %error, "Failed to record task result");
            self.managed.record_error();
        }
    }

    async fn run_persisted(&self, claimed: ClaimedTask) {
        let ClaimedTask {
            mut task,
            definition,
            permit,
        } = claimed;

        if let Err(e) = self.tasks.mark_running(&mut task, definition.timeout).await {
            self.report_store_error(&task.id, &e);
            return;
        }

        let ctx = TaskContext::for_document(&task, definition.max_attempts);
        let started = Instant::now();
        let execution = self.execute(&definition, ctx).await;
        drop(permit);

        match execution {
            Execution::Completed(result) => {
                let output = result.output.clone();
                match self.tasks.complete(&mut task, &result).await {
                    Ok(Completion::Rescheduled { run_at }) => {
                        debug!(%run_at, "Task rescheduled");
                    }
                    Ok(Completion::Removed) => debug!("Task completed and removed"),
                    Ok(Completion::Unschedulable) => {
                        warn!("Next run is out of range, task marked failed");
                    }
                    Err(e) => self.report_store_error(&task.id, &e),
                }
                self.emit(TaskEvent::TaskRunSucceeded {
                    task_id: task.id,
                    task_type: task.task_type,
                    ephemeral: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    output,
                });
            }
            Execution::Errored(err) => {
                warn!(error = %err, attempt = task.failures + 1, "Task run failed");
                let will_retry = self.record_failure(&mut task, &definition, &err).await;
                self.emit(TaskEvent::TaskRunFailed {
                    task_id: task.id,
                    task_type: task.task_type,
                    ephemeral: false,
                    error: err.message,
                    kind: FailureKind::Run,
                    will_retry,
                });
            }
            Execution::TimedOut => {
                let timeout_ms = definition.timeout.as_millis() as u64;
                warn!(timeout_ms, "Task run timed out");
                let err = TaskRunError {
                    message: format!("timed out after {}ms", timeout_ms),
                    retry: if definition.retry_on_timeout {
                        RetryDirective::Policy
                    } else {
                        RetryDirective::Never
                    },
                };
                let will_retry = self.record_failure(&mut task, &definition, &err).await;
                self.emit(TaskEvent::TaskRunTimedOut {
                    task_id: task.id,
                    task_type: task.task_type,
                    ephemeral: false,
                    timeout_ms,
                    will_retry,
                });
            }
            Execution::Aborted => {
                // The execution lease expires and another owner picks it up
                info!("Task run abandoned during shutdown");
            }
        }
    }

    /// Write a failure back; returns whether the task will run again
    async fn record_failure(
        &self,
        task: &mut TaskDocument,
        definition: &TaskDefinition,
        err: &TaskRunError,
    ) -> bool {
        let now = Utc::now();
        let failures = task.failures + 1;
        let retry_at = match err.retry {
            _ if failures >= definition.max_attempts => None,
            RetryDirective::Never => None,
            RetryDirective::At(at) => Some(at),
            RetryDirective::Policy => Some(definition.retry_policy.next_retry_at(failures, now)),
        };

        // Retries exhausted: a recurring task falls back to its schedule
        let fallback = match (retry_at, task.interval) {
            (None, Some(interval)) if err.retry != RetryDirective::Never => {
                interval.next_after(now)
            }
            _ => None,
        };

        let result = match (retry_at, fallback) {
            (Some(_), _) => self.tasks.mark_failed(task, &err.message, retry_at).await,
            (None, Some(run_at)) => {
                task.last_error = Some(err.message.clone());
                self.tasks.complete_recurring(task, run_at).await
            }
            (None, None) => self.tasks.mark_failed(task, &err.message, None).await,
        };

        if let Err(e) = result {
            self.report_store_error(&task.id, &e);
        }
        retry_at.is_some() || fallback.is_some()
    }

    async fn run_ephemeral(&self, work: EphemeralWork) {
        let EphemeralWork {
            id,
            definition,
            params,
            run_state,
            permit,
            responder,
        } = work;

        let ctx = TaskContext::ephemeral(id.clone(), definition.task_type.clone(), params, run_state);
        let started = Instant::now();
        let execution = self.execute(&definition, ctx).await;
        drop(permit);

        let task_type = definition.task_type.clone();
        let outcome = match execution {
            Execution::Completed(result) => {
                self.emit(TaskEvent::TaskRunSucceeded {
                    task_id: id,
                    task_type,
                    ephemeral: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    output: result.output.clone(),
                });
                RunOutcome::Succeeded {
                    output: result.output,
                }
            }
            Execution::Errored(err) => {
                warn!(error = %err, "Ephemeral task failed");
                self.emit(TaskEvent::TaskRunFailed {
                    task_id: id,
                    task_type,
                    ephemeral: true,
                    error: err.message.clone(),
                    kind: FailureKind::Run,
                    will_retry: false,
                });
                RunOutcome::Failed {
                    error: err.message,
                    kind: FailureKind::Run,
                    will_retry: false,
                }
            }
            Execution::TimedOut => {
                self.emit(TaskEvent::TaskRunTimedOut {
                    task_id: id,
                    task_type,
                    ephemeral: true,
                    timeout_ms: definition.timeout.as_millis() as u64,
                    will_retry: false,
                });
                RunOutcome::TimedOut { will_retry: false }
            }
            Execution::Aborted => {
                self.emit(TaskEvent::EphemeralTaskDropped {
                    task_id: id,
                    task_type,
                });
                // Dropping the responder resolves the handle as dropped
                return;
            }
        };

        // The caller may have stopped waiting
        let _ = responder.send(outcome);
    }

    /// Run one execution under the definition's timeout
    async fn execute(&self, definition: &TaskDefinition, ctx: TaskContext) -> Execution {
        let runner = definition.create_runner(&ctx);
        let cancellation = ctx.cancellation_token();

        let execution = tokio::select! {
            result = tokio::time::timeout(definition.timeout, runner.run(ctx)) => match result {
                Ok(Ok(result)) => Execution::Completed(result),
                Ok(Err(err)) => Execution::Errored(err),
                Err(_) => Execution::TimedOut,
            },
            _ = self.abort.cancelled() => Execution::Aborted,
        };

        if matches!(execution, Execution::TimedOut | Execution::Aborted) {
            cancellation.cancel();
            if tokio::time::timeout(CANCEL_GRACE, runner.cancel())
                .await
                .is_err()
            {
                warn!("Runner did not acknowledge cancellation");
            }
        }
        execution
    }
}
