//! Polling lifecycle
//!
//! One control loop per process: read the managed snapshot, claim what
//! fits into free capacity, hand it to the worker pool, wait for the next
//! tick. Cycle failures feed the managed configuration, which slows the
//! loop down; they never end it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::capacity::CapacityTracker;
use super::managed::ManagedConfiguration;
use super::pool::{Work, WorkerPool};
use crate::engine::TaskTypeRegistry;
use crate::monitoring::TaskEvent;
use crate::persistence::{StoreError, TaskStore};

/// Lifecycle state of the poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Initialized,
    Polling,
    WaitingForCapacity,
    Stopped,
}

impl PollerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Polling => "polling",
            Self::WaitingForCapacity => "waiting_for_capacity",
            Self::Stopped => "stopped",
        }
    }
}

/// Summary of one successful cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub unrecognized: usize,
    /// Claimed tasks handed back because shutdown began mid-cycle
    pub released: usize,
}

/// The polling control loop
pub struct TaskPoller {
    owner_id: String,
    tasks: Arc<TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    pool: Arc<WorkerPool>,
    capacity: Arc<CapacityTracker>,
    managed: Arc<ManagedConfiguration>,
    events: broadcast::Sender<TaskEvent>,
    state: watch::Sender<PollerState>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_timeout: Duration,
}

impl TaskPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner_id: String,
        tasks: Arc<TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        pool: Arc<WorkerPool>,
        capacity: Arc<CapacityTracker>,
        managed: Arc<ManagedConfiguration>,
        events: broadcast::Sender<TaskEvent>,
        state: watch::Sender<PollerState>,
            shutdown_rx: watch::Receiver<bool>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            owner_id,
            tasks,
            registry,
            pool,
            capacity,
            managed,
            events,
            state,
            shutdown_rx,
            shutdown_timeout,
        }
    }

    fn set_state(&self, state: PollerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = current.as_str(), to = state.as_str(), "Poller state change");
            *current = state;
            true
        });
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until shutdown, then drain the pool and report `Stopped`
    #[instrument(skip(self), fields(owner_id = %self.owner_id))]
    pub async fn run(self) {
        info!("Poll loop started");
        self.set_state(PollerState::Polling);

        loop {
            if self.is_shutdown() {
                break;
            }

            let snapshot = self.managed.snapshot();
            self.capacity.set_ceiling(snapshot.capacity);

            if !self.capacity.fits(self.registry.min_cost()) {
                // Nothing could be claimed; skip the query entirely
                self.set_state(PollerState::WaitingForCapacity);
                if self.wait(snapshot.poll_interval).await {
                    break;
                }
                continue;
            }

            self.set_state(PollerState::Polling);
            match self.poll_cycle().await {
                Ok(report) => {
                    self.managed.record_success();
                    let _ = self.events.send(TaskEvent::PollCycleCompleted {
                        claimed: report.claimed,
                        conflicts: report.conflicts,
                        skipped: report.skipped,
                    });
                }
                Err(e) => {
                    let snapshot = self.managed.record_error();
                    warn!(
                        error = %e,
                        retryable = e.is_retryable(),
                        next_interval_ms = snapshot.poll_interval.as_millis() as u64,
                        "Poll cycle failed"
                    );
                    let _ = self.events.send(TaskEvent::PollCycleFailed {
                        error: e.to_string(),
                    });
                }
            }

            if self.wait(self.managed.snapshot().poll_interval).await {
                break;
            }
        }

        info!("Poll loop stopping, draining worker pool");
        let report = self.pool.drain(self.shutdown_timeout).await;
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "Runs abandoned at shutdown");
        }
        self.set_state(PollerState::Stopped);
        info!("Poll loop stopped");
    }

    /// One claim-and-dispatch pass
    #[instrument(skip(self), fields(owner_id = %self.owner_id))]
    pub async fn poll_cycle(&self) -> Result<CycleReport, StoreError> {
        let outcome = self
            .tasks
            .claim_available(&self.owner_id, &self.capacity)
            .await?;

        let mut report = CycleReport {
            claimed: outcome.claimed.len(),
            conflicts: outcome.conflicts,
            skipped: outcome.skipped,
            unrecognized: outcome.unrecognized.len(),
            released: 0,
        };

        for task in outcome.unrecognized {
            self.pool.fail_unrecognized(task).await;
        }

        for claimed in outcome.claimed {
            if self.is_shutdown() {
                let mut task = claimed.task;
                match self.tasks.release(&mut task).await {
                    Ok(()) => report.released += 1,
                    Err(e) => warn!(task_id = %task.id, error = %e, "Failed to release task"),
                }
                continue;
            }

            let _ = self.events.send(TaskEvent::TaskClaimed {
                task_id: claimed.task.id.clone(),
                task_type: claimed.task.task_type.clone(),
                owner_id: self.owner_id.clone(),
            });
            self.pool.dispatch(Work::Persisted(claimed));
        }

        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                conflicts = report.conflicts,
                "Dispatched claimed tasks"
            );
        }
        Ok(report)
    }

    /// Wait for the next tick
    ///
    /// Returns true if shutdown was signaled.
    async fn wait(&self, interval: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }
}
