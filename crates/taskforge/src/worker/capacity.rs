//! Capacity accounting for worker pools
//!
//! Tracks the cost of in-flight runs against a ceiling so that new work
//! is only started when it fits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::task::TaskCost;

struct CapacityState {
    ceiling: u32,
    in_use: u32,
    running_by_type: HashMap<String, u32>,
}

/// Cost-weighted capacity counter
///
/// Reservation and release happen under one mutex, so the sum of
/// reserved costs never exceeds the ceiling in force at reservation time.
/// Lowering the ceiling does not revoke existing reservations; it only
/// blocks new ones until enough runs finish.
pub struct CapacityTracker {
    name: &'static str,
    state: Mutex<CapacityState>,
    released: Notify,
}

/// Usage figures for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapacityUsage {
    pub ceiling: u32,
    pub in_use: u32,
    pub available: u32,
    pub utilization: f64,
}

impl CapacityTracker {
    /// Create a tracker with an initial ceiling
    pub fn new(name: &'static str, ceiling: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(CapacityState {
                ceiling,
                in_use: 0,
                running_by_type: HashMap::new(),
            }),
            released: Notify::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reserve `cost` for one run of `task_type` if it fits
    ///
    /// Fails when the cost would exceed the ceiling or the type already
    /// runs `max_concurrency` instances.
    pub fn try_reserve(
        self: &Arc<Self>,
        task_type: &str,
        cost: TaskCost,
        max_concurrency: Option<u32>,
    ) -> Option<CapacityPermit> {
        let mut state = self.state.lock();

        if state.in_use + cost.units() > state.ceiling {
            return None;
        }

        let running = state.running_by_type.get(task_type).copied().unwrap_or(0);
        if max_concurrency.is_some_and(|max| running >= max) {
            return None;
        }

        state.in_use += cost.units();
        *state.running_by_type.entry(task_type.to_string()).or_insert(0) += 1;

        Some(CapacityPermit {
            tracker: Arc::clone(self),
            task_type: task_type.to_string(),
            cost,
        })
    }

    /// Wait until `cost` can be reserved
    ///
    /// A cost larger than the ceiling waits until the ceiling grows.
    pub async fn reserve(
        self: &Arc<Self>,
        task_type: &str,
        cost: TaskCost,
        max_concurrency: Option<u32>,
    ) -> CapacityPermit {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register interest before checking to avoid a lost wakeup
            released.as_mut().enable();

            if let Some(permit) = self.try_reserve(task_type, cost, max_concurrency) {
                return permit;
            }
            released.await;
        }
    }

    /// Whether a run of `cost` would fit right now
    pub fn fits(&self, cost: TaskCost) -> bool {
        let state = self.state.lock();
        state.in_use + cost.units() <= state.ceiling
    }

    /// Number of running instances of a task type
    pub fn running(&self, task_type: &str) -> u32 {
        self.state
            .lock()
            .running_by_type
            .get(task_type)
            .copied()
            .unwrap_or(0)
    }

    /// Apply a new ceiling to future reservations
    pub fn set_ceiling(&self, ceiling: u32) {
        let raised = {
            let mut state = self.state.lock();
            let raised = ceiling > state.ceiling;
            state.ceiling = ceiling;
            raised
        };
        if raised {
            self.released.notify_waiters();
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.state.lock().ceiling
    }

    pub fn in_use(&self) -> u32 {
        self.state.lock().in_use
    }

    /// Free capacity units (zero while over a lowered ceiling)
    pub fn available(&self) -> u32 {
        let state = self.state.lock();
        state.ceiling.saturating_sub(state.in_use)
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().in_use == 0
    }

    pub fn usage(&self) -> CapacityUsage {
        let state = self.state.lock();
        CapacityUsage {
            ceiling: state.ceiling,
            in_use: state.in_use,
            available: state.ceiling.saturating_sub(state.in_use),
            utilization: state.in_use as f64 / state.ceiling.max(1) as f64,
        }
    }

    fn release(&self, task_type: &str, cost: TaskCost) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(cost.units());
            if let Some(running) = state.running_by_type.get_mut(task_type) {
                *running = running.saturating_sub(1);
                if *running == 0 {
                    state.running_by_type.remove(task_type);
                }
            }
        }
        self.released.notify_waiters();
    }
}

/// Reserved capacity for one run; released on drop
pub struct CapacityPermit {
    tracker: Arc<CapacityTracker>,
    task_type: String,
    cost: TaskCost,
}

impl CapacityPermit {
    pub fn cost(&self) -> TaskCost {
        self.cost
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

impl std::fmt::Debug for CapacityPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityPermit")
            .field("tracker", &self.tracker.name)
            .field("task_type", &self.task_type)
            .field("cost", &self.cost)
            .finish()
    }
}

impl Drop for CapacityPermit {
    fn drop(&mut self) {
        self.tracker.release(&self.task_type, self.cost);
    }
}
