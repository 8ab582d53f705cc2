// Task types registered by the demo server

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use taskforge::{
    RegistryError, RetryPolicy, TaskCost, TaskDefinition, TaskRunError, TaskRunResult,
    TaskTypeRegistry,
};

#[derive(Debug, Deserialize)]
struct LogParams {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

/// Registry with the demo task types
pub fn registry() -> Result<TaskTypeRegistry, RegistryError> {
    let mut registry = TaskTypeRegistry::new();

    registry.register(
        TaskDefinition::from_fn("log_message", |ctx| async move {
            let params: LogParams = ctx.params_as()?;
            tracing::info!(task_id = %ctx.task_id, message = %params.message, "log_message");
            Ok(TaskRunResult::done())
        })
        .with_title("Log a message")
        .with_cost(TaskCost::TINY),
    )?;

    registry.register(
        TaskDefinition::from_fn("sleep", |ctx| async move {
            let params: SleepParams = ctx.params_as()?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(params.ms)) => {
                    Ok(TaskRunResult::done().with_output(json!({ "slept_ms": params.ms })))
                }
                _ = ctx.cancelled() => Err(TaskRunError::retryable("cancelled")),
            }
        })
        .with_title("Sleep for a while")
        .with_timeout(Duration::from_secs(10))
        .with_retry_on_timeout(true)
        .with_retry_policy(RetryPolicy::exponential()),
    )?;

    // Recurring; keeps a counter in its run state
    registry.register(
        TaskDefinition::from_fn("heartbeat", |ctx| async move {
            let beats = ctx.run_state["beats"].as_u64().unwrap_or(0) + 1;
            tracing::debug!(beats, "heartbeat");
            Ok(TaskRunResult::done().with_state(json!({ "beats": beats })))
        })
        .with_title("Periodic heartbeat")
        .with_cost(TaskCost::TINY)
        .with_max_concurrency(1),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_registry() {
        let registry = registry().unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("heartbeat"));
        assert_eq!(registry.min_cost(), TaskCost::TINY);
    }
}
