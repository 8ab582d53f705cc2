//! # Taskforge
//!
//! Background task scheduling and distributed execution over a versioned
//! document store.
//!
//! ## Features
//!
//! - **Optimistic claiming**: many processes poll one store; a version-checked
//!   update decides which process runs a task
//! - **Cost-based capacity**: task types declare a cost, each process bounds the
//!   total cost in flight
//! - **Managed configuration**: store errors back off the poll interval and shrink
//!   capacity, success restores both
//! - **Recurring tasks and retries**: interval rescheduling, per-type retry
//!   policies and timeouts
//! - **Ephemeral lane**: run a registered task immediately without persisting it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskManager                          │
//! │  (schedule, ensure_scheduled, run_now, ephemeral_run_now)   │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                 │
//!                ▼                                 ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │          TaskPoller          │  │        EphemeralLane         │
//! │ (claim by versioned update)  │  │  (bounded in-memory queue)   │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!                │                                 │
//!                ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                           │
//! │     (timeouts, retries, completion, lifecycle events)       │
//! └─────────────────────────────────────────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                TaskStore  →  DocumentStore                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use taskforge::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = TaskTypeRegistry::new();
//! registry.register(
//!     TaskDefinition::from_fn("report", |ctx| async move {
//!         let _params = ctx.params.clone();
//!         Ok(TaskRunResult::done().with_output(json!({"rows": 42})))
//!     })
//!     .with_cost(TaskCost::NORMAL)
//!     .with_timeout(Duration::from_secs(30))
//!     .with_retry_policy(RetryPolicy::exponential()),
//! )?;
//!
//! let manager = TaskManager::new(
//!     TaskManagerConfig::new("node-1"),
//!     Arc::new(InMemoryDocumentStore::new()),
//!     registry,
//! )?;
//! manager.start()?;
//!
//! manager
//!     .ensure_scheduled(
//!         ScheduleRequest::new("report", json!({"tenant": "acme"}))
//!             .with_interval(Interval::from_mins(5)),
//!     )
//!     .await?;
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod manager;
pub mod monitoring;
pub mod persistence;
pub mod reliability;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, EphemeralSettings, ManagedSettings, TaskManagerConfig};
    pub use crate::engine::{RegistryError, TaskTypeRegistry};
    pub use crate::manager::{TaskManager, TaskManagerError};
    pub use crate::monitoring::{HealthSnapshot, HealthStatus, RunOutcome, TaskEvent};
    pub use crate::persistence::{
        DocumentStore, InMemoryDocumentStore, ScheduleRequest, SearchQuery, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::task::{
        Interval, TaskContext, TaskCost, TaskDefinition, TaskDocument, TaskRunError,
        TaskRunResult, TaskRunner, TaskStatus,
    };
    pub use crate::worker::{EphemeralError, EphemeralTask, PollerState};
}

// Re-export key types at crate root
pub use config::{ConfigError, EphemeralSettings, ManagedSettings, TaskManagerConfig};
pub use engine::{RegistryError, TaskTypeRegistry};
pub use manager::{TaskManager, TaskManagerError};
pub use monitoring::{HealthSnapshot, HealthStatus, RunOutcome, TaskEvent};
pub use persistence::{
    DocumentStore, InMemoryDocumentStore, ScheduleRequest, SearchQuery, StoreError, TaskStore,
};
pub use reliability::RetryPolicy;
pub use task::{
    Interval, RetryDirective, TaskContext, TaskCost, TaskDefinition, TaskDocument, TaskRunError,
    TaskRunResult, TaskRunner, TaskStatus,
};
pub use worker::{EphemeralError, EphemeralTask, EphemeralTaskHandle, PollerState};
