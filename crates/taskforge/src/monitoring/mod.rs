//! Monitoring and health
//!
//! This module provides:
//! - [`TaskEvent`] - lifecycle events broadcast by the task manager
//! - [`MonitoringAggregator`] - folds events into per-type counters
//! - [`HealthSnapshot`] - the pull-based view served by the health endpoint

mod aggregator;
mod events;
mod health;

pub use aggregator::{CycleStats, MonitoringAggregator, TaskTypeStats};
pub use events::{FailureKind, RunOutcome, TaskEvent};
pub use health::{EphemeralHealth, HealthInputs, HealthSnapshot, HealthStatus};
