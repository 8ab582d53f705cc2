//! Task execution context

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::document::TaskDocument;

/// Context handed to a task runner for one execution attempt
///
/// The context provides:
/// - The task's params and the state left by its previous run
/// - Attempt information
/// - Cancellation detection (set when the run times out or the
///   process shuts down)
///
/// # Example
///
/// ```ignore
/// async fn run(&self, ctx: TaskContext) -> Result<TaskRunResult, TaskRunError> {
///     tokio::select! {
///         result = do_work(ctx.params_as::<Input>()?) => result,
///         _ = ctx.cancelled() => Err(TaskRunError::non_retryable("cancelled")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task id (transient for ephemeral tasks)
    pub task_id: String,

    pub task_type: String,

    pub params: Value,

    /// State persisted by the previous run
    pub run_state: Value,

    /// Attempt number within the current retry sequence (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the task type
    pub max_attempts: u32,

    pub scheduled_at: DateTime<Utc>,

    /// Whether this run comes from the ephemeral lane
    pub ephemeral: bool,

    cancellation: CancellationToken,
}

impl TaskContext {
    /// Create a context for a persisted task that has just been marked running
    pub fn for_document(task: &TaskDocument, max_attempts: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            params: task.params.clone(),
            run_state: task.run_state.clone(),
            attempt: task.failures + 1,
            max_attempts,
            scheduled_at: task.scheduled_at,
            ephemeral: false,
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a context for an ephemeral run
    pub fn ephemeral(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        params: Value,
        run_state: Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            params,
            run_state,
            attempt: 1,
            max_attempts: 1,
            scheduled_at: Utc::now(),
            ephemeral: true,
            cancellation: CancellationToken::new(),
        }
    }

    /// Deserialize the params into a concrete type
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }

    /// Token cancelled when this run must stop
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
