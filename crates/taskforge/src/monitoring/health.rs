//! Pull-based health snapshot

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::aggregator::{CycleStats, TaskTypeStats};
use crate::worker::{CapacityUsage, ManagedSnapshot, PollerState};

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warn,
    Error,
}

/// Ephemeral lane figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EphemeralHealth {
    pub enabled: bool,
    pub queue_depth: usize,
    pub capacity: CapacityUsage,
}

/// Point-in-time view for the health endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub owner_id: String,
    pub poller_state: PollerState,

    /// Claimable tasks in the store; `None` when the count itself failed
    pub queue_depth: Option<usize>,

    pub capacity: CapacityUsage,
    pub in_flight: usize,
    pub ephemeral: EphemeralHealth,
    pub poll_interval_ms: u64,
    pub error_rate: f64,
    pub consecutive_cycle_errors: u32,
    pub cycles: CycleStats,
    pub task_types: BTreeMap<String, TaskTypeStats>,
    pub generated_at: DateTime<Utc>,
}

/// Inputs gathered by the task manager
pub struct HealthInputs {
    pub owner_id: String,
    pub poller_state: PollerState,
    pub queue_depth: Option<usize>,
    pub capacity: CapacityUsage,
    pub configured_capacity: u32,
    pub in_flight: usize,
    pub ephemeral: EphemeralHealth,
    pub managed: ManagedSnapshot,
    pub error_threshold: usize,
    pub cycles: CycleStats,
    pub task_types: BTreeMap<String, TaskTypeStats>,
}

impl HealthSnapshot {
    pub fn from_inputs(inputs: HealthInputs) -> Self {
        let status = evaluate(&inputs);
        Self {
            status,
            owner_id: inputs.owner_id,
            poller_state: inputs.poller_state,
            queue_depth: inputs.queue_depth,
            capacity: inputs.capacity,
            in_flight: inputs.in_flight,
            ephemeral: inputs.ephemeral,
            poll_interval_ms: inputs.managed.poll_interval.as_millis() as u64,
            error_rate: inputs.managed.error_rate(),
            consecutive_cycle_errors: inputs.managed.consecutive_errors,
            cycles: inputs.cycles,
            task_types: inputs.task_types,
            generated_at: Utc::now(),
        }
    }
}

/// `error` when stopped or failing persistently, `warn` while degraded
fn evaluate(inputs: &HealthInputs) -> HealthStatus {
    let managed = &inputs.managed;

    if inputs.poller_state == PollerState::Stopped
        || managed.consecutive_errors as usize >= inputs.error_threshold.max(1)
    {
        return HealthStatus::Error;
    }

    if inputs.poller_state == PollerState::Initialized
        || managed.consecutive_errors > 0
        || managed.capacity < inputs.configured_capacity
        || inputs.queue_depth.is_none()
    {
        return HealthStatus::Warn;
    }

    HealthStatus::Ok
}
