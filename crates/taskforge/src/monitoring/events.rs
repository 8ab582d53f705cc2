//! Task lifecycle events

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The runner returned an error
    Run,
    /// The task could not be run at all (unknown type, malformed document)
    Validation,
}

/// Final result of one run, as seen by `run_now` and ephemeral callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        output: Option<Value>,
    },
    Failed {
        error: String,
        kind: FailureKind,
        will_retry: bool,
    },
    TimedOut {
        will_retry: bool,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Event published on the task manager's broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskClaimed {
        task_id: String,
        task_type: String,
        owner_id: String,
    },
    TaskRunSucceeded {
        task_id: String,
        task_type: String,
        ephemeral: bool,
        duration_ms: u64,
        output: Option<Value>,
    },
    TaskRunFailed {
        task_id: String,
        task_type: String,
        ephemeral: bool,
        error: String,
        kind: FailureKind,
        will_retry: bool,
    },
    TaskRunTimedOut {
        task_id: String,
        task_type: String,
        ephemeral: bool,
        timeout_ms: u64,
        will_retry: bool,
    },
    PollCycleCompleted {
        claimed: usize,
        conflicts: usize,
        skipped: usize,
    },
    PollCycleFailed {
        error: String,
    },
    EphemeralTaskDropped {
        task_id: String,
        task_type: String,
    },
}

impl TaskEvent {
    /// Task the event refers to, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskClaimed { task_id, .. }
            | Self::TaskRunSucceeded { task_id, .. }
            | Self::TaskRunFailed { task_id, .. }
            | Self::TaskRunTimedOut { task_id, .. }
            | Self::EphemeralTaskDropped { task_id, .. } => Some(task_id),
            Self::PollCycleCompleted { .. } | Self::PollCycleFailed { .. } => None,
        }
    }

    pub fn task_type(&self) -> Option<&str> {
        match self {
            Self::TaskClaimed { task_type, .. }
            | Self::TaskRunSucceeded { task_type, .. }
            | Self::TaskRunFailed { task_type, .. }
            | Self::TaskRunTimedOut { task_type, .. }
            | Self::EphemeralTaskDropped { task_type, .. } => Some(task_type),
            Self::PollCycleCompleted { .. } | Self::PollCycleFailed { .. } => None,
        }
    }

    /// Run outcome carried by run events
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            Self::TaskRunSucceeded { output, .. } => Some(RunOutcome::Succeeded {
                output: output.clone(),
            }),
            Self::TaskRunFailed {
                error,
                kind,
                will_retry,
                ..
            } => Some(RunOutcome::Failed {
                error: error.clone(),
                kind: *kind,
                will_retry: *will_retry,
            }),
            Self::TaskRunTimedOut { will_retry, .. } => Some(RunOutcome::TimedOut {
                will_retry: *will_retry,
            }),
            _ => None,
        }
    }
}
