//! Ephemeral task lifecycle
//!
//! Immediate, in-memory execution that bypasses the document store.
//! Requests wait in a bounded queue; a drain loop reserves capacity from
//! a dedicated tracker and hands each request to the shared worker pool.
//! Nothing here survives a restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::capacity::CapacityTracker;
use super::managed::ManagedConfiguration;
use super::pool::{EphemeralWork, Work, WorkerPool};
use crate::config::EphemeralSettings;
use crate::engine::TaskTypeRegistry;
use crate::monitoring::{RunOutcome, TaskEvent};
use crate::task::TaskDefinition;

/// Synchronous rejections and the dropped-at-shutdown result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EphemeralError {
    /// The lane is disabled; schedule a persisted task instead
    #[error("ephemeral tasks are disabled")]
    Disabled,

    #[error("ephemeral queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("task manager is shutting down")]
    ShuttingDown,

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// One run of this type needs more than the lane's whole capacity
    #[error("task type {task_type} costs {cost} units, lane capacity is {capacity}")]
    ExceedsCapacity {
        task_type: String,
        cost: u32,
        capacity: u32,
    },

    /// Accepted, then discarded before it finished
    #[error("ephemeral task was dropped before completion")]
    Dropped,
}

/// Request for an immediate, non-persisted run
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralTask {
    pub task_type: String,
    pub params: Value,
    pub run_state: Value,
}

impl EphemeralTask {
    pub fn new(task_type: impl Into<String>, params: Value) -> Self {
        Self {
            task_type: task_type.into(),
            params,
            run_state: Value::Null,
        }
    }

    pub fn with_run_state(mut self, run_state: Value) -> Self {
        self.run_state = run_state;
        self
    }
}

/// Caller's handle on an accepted ephemeral task
#[derive(Debug)]
pub struct EphemeralTaskHandle {
    id: String,
    result: oneshot::Receiver<RunOutcome>,
}

impl EphemeralTaskHandle {
    /// Transient id, valid only within this process
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the run to finish
    pub async fn outcome(self) -> Result<RunOutcome, EphemeralError> {
        self.result.await.map_err(|_| EphemeralError::Dropped)
    }
}

struct QueuedTask {
    id: String,
    definition: Arc<TaskDefinition>,
    task: EphemeralTask,
    responder: oneshot::Sender<RunOutcome>,
}

/// Bounded queue plus its drain loop
pub struct EphemeralLane {
    settings: EphemeralSettings,
    registry: Arc<TaskTypeRegistry>,
    capacity: Arc<CapacityTracker>,
    sender: mpsc::Sender<QueuedTask>,
    receiver: Mutex<Option<mpsc::Receiver<QueuedTask>>>,
    accepting: AtomicBool,
    events: broadcast::Sender<TaskEvent>,
}

impl EphemeralLane {
    pub fn new(
        settings: EphemeralSettings,
        registry: Arc<TaskTypeRegistry>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            capacity: CapacityTracker::new("ephemeral", settings.capacity),
            settings,
            registry,
            sender,
            receiver: Mutex::new(Some(receiver)),
            accepting: AtomicBool::new(true),
            events,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn capacity(&self) -> &Arc<CapacityTracker> {
        &self.capacity
    }

    /// Requests accepted but not yet started
    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Queue a task for immediate execution
    ///
    /// Every rejection is reported here; nothing is silently discarded.
    pub fn submit(&self, task: EphemeralTask) -> Result<EphemeralTaskHandle, EphemeralError> {
        if !self.settings.enabled {
            return Err(EphemeralError::Disabled);
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EphemeralError::ShuttingDown);
        }

        let definition = self
            .registry
            .get(&task.task_type)
            .map_err(|_| EphemeralError::UnknownTaskType(task.task_type.clone()))?;
        if definition.cost.units() > self.settings.capacity {
            return Err(EphemeralError::ExceedsCapacity {
                task_type: task.task_type,
                cost: definition.cost.units(),
                capacity: self.settings.capacity,
            });
        }

        let id = Uuid::now_v7().to_string();
        let (responder, result) = oneshot::channel();
        let queued = QueuedTask {
            id: id.clone(),
            definition,
            task,
            responder,
        };

        match self.sender.try_send(queued) {
            Ok(()) => {
                debug!(task_id = %id, "Ephemeral task queued");
                Ok(EphemeralTaskHandle { id, result })
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EphemeralError::QueueFull {
                capacity: self.settings.queue_capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EphemeralError::ShuttingDown),
        }
    }

    /// Stop accepting new requests
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Drain the queue into the pool until shutdown
    ///
    /// Requests still queued at shutdown are dropped and their handles
    /// resolve to [`EphemeralError::Dropped`].
    #[instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        pool: Arc<WorkerPool>,
        managed: Arc<ManagedConfiguration>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            warn!("Ephemeral lane already running");
            return;
        };
        info!(
            queue_capacity = self.settings.queue_capacity,
            capacity = self.settings.capacity,
            "Ephemeral lane started"
        );
        let mut managed_capacity = managed.watch_capacity();

        while !*shutdown_rx.borrow() {
            let queued = tokio::select! {
                queued = receiver.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            self.apply_ceiling(*managed_capacity.borrow_and_update());

            // The ceiling follows managed capacity while the request waits
            let definition = Arc::clone(&queued.definition);
            let permit = loop {
                tokio::select! {
                    permit = self.capacity.reserve(
                        &definition.task_type,
                        definition.cost,
                        definition.max_concurrency,
                    ) => break Some(permit),
                    Ok(()) = managed_capacity.changed() => {
                        self.apply_ceiling(*managed_capacity.borrow_and_update());
                    }
                    _ = shutdown_rx.changed() => break None,
                }
            };
            let Some(permit) = permit else {
                self.drop_queued(queued);
                break;
            };

            let QueuedTask {
                id,
                definition,
                task,
                responder,
            } = queued;
            pool.dispatch(Work::Ephemeral(EphemeralWork {
                id,
                definition,
                params: task.params,
                run_state: task.run_state,
                permit,
                responder,
            }));
        }

        self.close();
        receiver.close();
        let mut dropped = 0;
        while let Ok(queued) = receiver.try_recv() {
            self.drop_queued(queued);
            dropped += 1;
        }
        info!(dropped, "Ephemeral lane stopped");
    }

    fn apply_ceiling(&self, managed_capacity: u32) {
        let ceiling = self.settings.capacity.min(managed_capacity);
        if ceiling != self.capacity.ceiling() {
            debug!(ceiling, "Ephemeral capacity ceiling updated");
        }
        self.capacity.set_ceiling(ceiling);
    }

    fn drop_queued(&self, queued: QueuedTask) {
        warn!(task_id = %queued.id, task_type = %queued.task.task_type, "Dropping ephemeral task");
        let _ = self.events.send(TaskEvent::EphemeralTaskDropped {
            task_id: queued.id,
            task_type: queued.task.task_type,
        });
    }
}
