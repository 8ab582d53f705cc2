//! Task execution
//!
//! This module provides:
//! - [`ManagedConfiguration`] - poll interval and capacity driven by cycle outcomes
//! - [`CapacityTracker`] - cost-weighted capacity accounting
//! - [`WorkerPool`] - runs persisted and ephemeral work under timeouts
//! - [`TaskPoller`] - the polling lifecycle
//! - [`EphemeralLane`] - the in-memory, immediate-execution lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │        TaskPoller        │        │      EphemeralLane       │
//! │ (tick, claim, dispatch)  │        │ (bounded queue, drain)   │
//! └────────────┬─────────────┘        └────────────┬─────────────┘
//!              │  CapacityTracker                  │  CapacityTracker
//!              │  (persisted)                      │  (ephemeral)
//!              ▼                                   ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                           │
//! │   Work::Persisted → TaskStore    Work::Ephemeral → oneshot   │
//! └──────────────────────────────────────────────────────────────┘
//!              ▲
//!              │ snapshot before each cycle
//! ┌────────────┴─────────────┐
//! │   ManagedConfiguration   │
//! └──────────────────────────┘
//! ```

mod capacity;
mod ephemeral;
mod managed;
mod poller;
mod pool;

pub use capacity::{CapacityPermit, CapacityTracker, CapacityUsage};
pub use ephemeral::{EphemeralError, EphemeralLane, EphemeralTask, EphemeralTaskHandle};
pub use managed::{
    CycleOutcome, ExponentialThrottle, ManagedConfiguration, ManagedSnapshot, ThrottleLimits,
    ThrottlePolicy,
};
pub use poller::{CycleReport, PollerState, TaskPoller};
pub use pool::{DrainReport, EphemeralWork, Work, WorkerPool};
