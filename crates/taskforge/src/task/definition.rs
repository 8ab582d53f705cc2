//! Task type definitions and the runner contract

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::TaskContext;
use crate::reliability::RetryPolicy;

/// Capacity units one running instance of a task type consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskCost(pub u32);

impl TaskCost {
    pub const TINY: TaskCost = TaskCost(1);
    pub const NORMAL: TaskCost = TaskCost(2);
    pub const EXTRA_LARGE: TaskCost = TaskCost(10);

    pub fn units(&self) -> u32 {
        self.0
    }
}

impl Default for TaskCost {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Successful run outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRunResult {
    /// Replacement for the task's persisted run state
    pub run_state: Option<Value>,

    /// Explicit next run time; makes a one-shot task run again
    pub run_at: Option<DateTime<Utc>>,

    /// Value returned to `run_now` / ephemeral callers
    pub output: Option<Value>,
}

impl TaskRunResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.run_state = Some(state);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// How a failed run wants to be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDirective {
    /// Follow the task type's retry policy
    Policy,
    /// Never retry this failure
    Never,
    /// Retry at a specific time (attempt limits still apply)
    At(#[serde(with = "chrono::serde::ts_milliseconds")] DateTime<Utc>),
}

/// Error raised by a task's own execution logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunError {
    pub message: String,
    pub retry: RetryDirective,
}

impl TaskRunError {
    /// A failure retried according to the task type's retry policy
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: RetryDirective::Policy,
        }
    }

    /// A permanent failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: RetryDirective::Never,
        }
    }

    /// A failure that asks to be retried at `at`
    pub fn retry_at(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            retry: RetryDirective::At(at),
        }
    }
}

impl fmt::Display for TaskRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskRunError {}

impl From<anyhow::Error> for TaskRunError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for TaskRunError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(format!("invalid params: {err}"))
    }
}

/// Run handle produced by a task type's factory for one execution
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute the task
    async fn run(&self, ctx: TaskContext) -> Result<TaskRunResult, TaskRunError>;

    /// Called when the run exceeded its timeout, before the run future is dropped
    async fn cancel(&self) {}
}

/// Factory creating a runner for one execution
pub type TaskRunnerFactory = Arc<dyn Fn(&TaskContext) -> Box<dyn TaskRunner> + Send + Sync>;

type RunFn = Arc<
    dyn Fn(TaskContext) -> BoxFuture<'static, Result<TaskRunResult, TaskRunError>> + Send + Sync,
>;

/// Runner backed by an async closure
struct FnRunner {
    run: RunFn,
}

#[async_trait]
impl TaskRunner for FnRunner {
    async fn run(&self, ctx: TaskContext) -> Result<TaskRunResult, TaskRunError> {
        (self.run)(ctx).await
    }
}

/// Registered contract for a task type
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskforge::{TaskCost, TaskDefinition, TaskRunResult};
///
/// let definition = TaskDefinition::from_fn("send_report", |ctx| async move {
///     let _recipient = ctx.params["to"].clone();
///     Ok(TaskRunResult::done())
/// })
/// .with_cost(TaskCost::TINY)
/// .with_timeout(Duration::from_secs(30));
///
/// assert_eq!(definition.task_type, "send_report");
/// ```
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_type: String,
    pub title: Option<String>,
    pub cost: TaskCost,

    /// Hard execution limit per run
    pub timeout: Duration,

    /// Runs allowed before a failing task becomes terminal
    pub max_attempts: u32,

    /// Per-process cap on concurrently running instances
    pub max_concurrency: Option<u32>,

    /// Whether a timed-out run is retried
    pub retry_on_timeout: bool,

    pub retry_policy: RetryPolicy,

    factory: TaskRunnerFactory,
}

impl TaskDefinition {
    /// Create a definition from a runner factory
    pub fn new<F>(task_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&TaskContext) -> Box<dyn TaskRunner> + Send + Sync + 'static,
    {
        Self {
            task_type: task_type.into(),
            title: None,
            cost: TaskCost::default(),
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            max_concurrency: None,
            retry_on_timeout: false,
            retry_policy: RetryPolicy::default(),
            factory: Arc::new(factory),
        }
    }

    /// Create a definition whose runs call an async closure
    pub fn from_fn<F, Fut>(task_type: impl Into<String>, run: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskRunResult, TaskRunError>> + Send + 'static,
    {
        let run: RunFn = Arc::new(move |ctx| Box::pin(run(ctx)));
        Self::new(task_type, move |_ctx: &TaskContext| {
            Box::new(FnRunner { run: run.clone() }) as Box<dyn TaskRunner>
        })
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_cost(mut self, cost: TaskCost) -> Self {
        self.cost = TaskCost(cost.0.max(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = Some(max.max(1));
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Instantiate a runner for one execution
    pub fn create_runner(&self, ctx: &TaskContext) -> Box<dyn TaskRunner> {
        (self.factory)(ctx)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_type", &self.task_type)
            .field("cost", &self.cost)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("max_concurrency", &self.max_concurrency)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish()
    }
}
