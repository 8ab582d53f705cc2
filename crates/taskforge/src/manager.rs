//! Task manager
//!
//! Wires the registry, task store, managed configuration, worker pool and
//! both lifecycles together, and exposes the producer-facing API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::{ConfigError, TaskManagerConfig};
use crate::engine::{RegistryError, TaskTypeRegistry};
use crate::monitoring::{
    EphemeralHealth, HealthInputs, HealthSnapshot, MonitoringAggregator, RunOutcome, TaskEvent,
};
use crate::persistence::{
    BulkRemoveResult, ClaimedTask, DocumentStore, ScheduleRequest, SearchQuery, StoreError,
    TaskStore,
};
use crate::task::{TaskDocument, TaskStatus};
use crate::worker::{
    CapacityTracker, EphemeralError, EphemeralLane, EphemeralTask, EphemeralTaskHandle,
    ExponentialThrottle, ManagedConfiguration, ManagedSnapshot, PollerState, TaskPoller,
    ThrottlePolicy, Work, WorkerPool,
};

/// Task manager errors
#[derive(Debug, thiserror::Error)]
pub enum TaskManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ephemeral(#[from] EphemeralError),

    /// A registered type costs more than the configured capacity and could never be claimed
    #[error("task type {task_type} costs {cost} units, more than the capacity of {capacity}")]
    TaskTypeExceedsCapacity {
        task_type: String,
        cost: u32,
        capacity: u32,
    },

    #[error("task manager is already started")]
    AlreadyStarted,

    #[error("task manager is not running")]
    NotRunning,

    /// `run_now` on a task another run currently owns
    #[error("task {id} is currently claimed by {owner}")]
    TaskBusy { id: String, owner: String },

    /// Another instance claimed the task between the lookup and the local claim
    #[error("task {0} was claimed by another instance")]
    RunClaimedElsewhere(String),

    /// Shutdown began before the requested run reported back
    #[error("task {0} did not finish before shutdown")]
    RunAborted(String),
}

/// Entry point for producers and the hosting process
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use taskforge::prelude::*;
///
/// # async fn example() -> Result<(), TaskManagerError> {
/// let mut registry = TaskTypeRegistry::new();
/// registry.register(TaskDefinition::from_fn("cleanup", |_ctx| async {
///     Ok(TaskRunResult::done())
/// }))?;
///
/// let manager = TaskManager::new(
///     TaskManagerConfig::new("node-1"),
///     Arc::new(InMemoryDocumentStore::new()),
///     registry,
/// )?;
/// manager.start()?;
///
/// manager
///     .schedule(ScheduleRequest::new("cleanup", json!({"older_than_days": 30})))
///     .await?;
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TaskManager {
    config: TaskManagerConfig,
    registry: Arc<TaskTypeRegistry>,
    tasks: Arc<TaskStore>,
    managed: Arc<ManagedConfiguration>,
    capacity: Arc<CapacityTracker>,
    pool: Arc<WorkerPool>,
    ephemeral: Arc<EphemeralLane>,
    monitoring: Arc<MonitoringAggregator>,
    events: broadcast::Sender<TaskEvent>,
    poller_state: watch::Receiver<PollerState>,
    poller_state_tx: Mutex<Option<watch::Sender<PollerState>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TaskManager {
    /// Build a manager with the default throttle policy
    ///
    /// Fails on invalid configuration, including a missing process identity.
    pub fn new(
        config: TaskManagerConfig,
        store: Arc<dyn DocumentStore>,
        registry: TaskTypeRegistry,
    ) -> Result<Self, TaskManagerError> {
        Self::with_throttle_policy(
            config,
            store,
            registry,
            Box::new(ExponentialThrottle::default()),
        )
    }

    /// Build a manager with a custom backoff curve
    pub fn with_throttle_policy(
        config: TaskManagerConfig,
        store: Arc<dyn DocumentStore>,
        registry: TaskTypeRegistry,
        policy: Box<dyn ThrottlePolicy>,
    ) -> Result<Self, TaskManagerError> {
        config.validate()?;
        if let Some(oversized) = registry
            .definitions()
            .find(|d| d.cost.units() > config.capacity)
        {
            return Err(TaskManagerError::TaskTypeExceedsCapacity {
                task_type: oversized.task_type.clone(),
                cost: oversized.cost.units(),
                capacity: config.capacity,
            });
        }

        let registry = Arc::new(registry);
        let tasks = Arc::new(TaskStore::new(
            store,
            Arc::clone(&registry),
            config.claim_lease,
        ));
        let managed = Arc::new(ManagedConfiguration::with_policy(&config, policy));
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&tasks),
            Arc::clone(&managed),
            events.clone(),
        ));
        let ephemeral = Arc::new(EphemeralLane::new(
            config.ephemeral.clone(),
            Arc::clone(&registry),
            events.clone(),
        ));
        let (poller_state_tx, poller_state) = watch::channel(PollerState::Initialized);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            owner_id = %config.owner_id,
            task_types = registry.len(),
            capacity = config.capacity,
            ephemeral = config.ephemeral.enabled,
            "Task manager created"
        );

        Ok(Self {
            capacity: CapacityTracker::new("persisted", config.capacity),
            config,
            registry,
            tasks,
            managed,
            pool,
            ephemeral,
            monitoring: Arc::new(MonitoringAggregator::new()),
            events,
            poller_state,
            poller_state_tx: Mutex::new(Some(poller_state_tx)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            monitor_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Start the poll loop and, when enabled, the ephemeral lane
    #[instrument(skip(self), fields(owner_id = %self.config.owner_id))]
    pub fn start(&self) -> Result<(), TaskManagerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TaskManagerError::AlreadyStarted);
        }
        let state_tx = self
            .poller_state_tx
            .lock()
            .take()
            .ok_or(TaskManagerError::AlreadyStarted)?;

        *self.monitor_handle.lock() = Some(self.monitoring.spawn(self.events.subscribe()));

        let poller = TaskPoller::new(
            self.config.owner_id.clone(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.capacity),
            Arc::clone(&self.managed),
            self.events.clone(),
            state_tx,
            self.shutdown_tx.subscribe(),
            self.config.shutdown_timeout,
        );

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(poller.run()));

        if self.ephemeral.is_enabled() {
            handles.push(tokio::spawn(Arc::clone(&self.ephemeral).run(
                Arc::clone(&self.pool),
                Arc::clone(&self.managed),
                self.shutdown_tx.subscribe(),
            )));
        }

        info!("Task manager started");
        Ok(())
    }

    /// Stop both lifecycles and wait for in-flight runs
    ///
    /// Runs still going after the shutdown timeout are cancelled; queued
    /// ephemeral requests are dropped.
    #[instrument(skip(self), fields(owner_id = %self.config.owner_id))]
    pub async fn shutdown(&self) {
        if !self.started.load(Ordering::Acquire) || *self.shutdown_tx.borrow() {
            return;
        }

        info!("Initiating graceful shutdown");
        self.ephemeral.close();
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Lifecycle task ended abnormally");
            }
        }

        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.abort();
        }
        info!("Task manager stopped");
    }

    fn ensure_running(&self) -> Result<(), TaskManagerError> {
        if !self.started.load(Ordering::Acquire) || *self.shutdown_tx.borrow() {
            return Err(TaskManagerError::NotRunning);
        }
        Ok(())
    }

    /// Persist a new task
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<TaskDocument, TaskManagerError> {
        self.registry.get(&request.task_type)?;
        Ok(self.tasks.schedule(request).await?)
    }

    /// Persist a task unless an equivalent one is already pending
    pub async fn ensure_scheduled(
        &self,
        request: ScheduleRequest,
    ) -> Result<TaskDocument, TaskManagerError> {
        self.registry.get(&request.task_type)?;
        Ok(self.tasks.ensure_scheduled(request).await?)
    }

    /// Run a persisted task on this instance now and wait for its outcome
    ///
    /// Waits for local capacity, then claims the task directly with a
    /// version-checked update and dispatches it, bypassing the poll cycle.
    #[instrument(skip(self), fields(owner_id = %self.config.owner_id))]
    pub async fn run_now(&self, id: &str) -> Result<RunOutcome, TaskManagerError> {
        self.ensure_running()?;

        let mut task = self.tasks.get(id).await?;
        if matches!(task.status, TaskStatus::Claiming | TaskStatus::Running)
            && !task.lease_expired(Utc::now())
        {
            return Err(TaskManagerError::TaskBusy {
                id: task.id,
                owner: task.owner_id.unwrap_or_default(),
            });
        }
        let definition = self.registry.get(&task.task_type)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let permit = tokio::select! {
            permit = self.capacity.reserve(
                &definition.task_type,
                definition.cost,
                definition.max_concurrency,
            ) => permit,
            _ = shutdown_rx.changed() => {
                return Err(TaskManagerError::RunAborted(id.to_string()));
            }
        };

        // Subscribe before dispatch so the result cannot be missed
        let mut events = self.events.subscribe();

        // Version-checked against the lookup above
        task.run_at = Utc::now();
        match self.tasks.claim(&mut task, &self.config.owner_id).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {
                warn!(task_id = %id, "Task changed before it could be claimed for run_now");
                return Err(TaskManagerError::RunClaimedElsewhere(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let _ = self.events.send(TaskEvent::TaskClaimed {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            owner_id: self.config.owner_id.clone(),
        });
        self.pool.dispatch(Work::Persisted(ClaimedTask {
            task,
            definition,
            permit,
        }));

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) if event.task_id() == Some(id) => {
                        if let Some(outcome) = event.outcome() {
                            return Ok(outcome);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "run_now fell behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TaskManagerError::RunAborted(id.to_string()));
                    }
                },
                _ = shutdown_rx.changed() => {
                    return Err(TaskManagerError::RunAborted(id.to_string()));
                }
            }
        }
    }

    /// Queue a task on the ephemeral lane
    ///
    /// Fails synchronously when the lane is disabled (use `schedule`
    /// instead), full, or shutting down.
    pub fn ephemeral_run_now(
        &self,
        task: EphemeralTask,
    ) -> Result<EphemeralTaskHandle, EphemeralError> {
        if *self.shutdown_tx.borrow() {
            return Err(EphemeralError::ShuttingDown);
        }
        self.ephemeral.submit(task)
    }

    pub async fn get(&self, id: &str) -> Result<TaskDocument, TaskManagerError> {
        Ok(self.tasks.get(id).await?)
    }

    pub async fn fetch(&self, query: &SearchQuery) -> Result<Vec<TaskDocument>, TaskManagerError> {
        Ok(self.tasks.fetch(query).await?)
    }

    pub async fn remove(&self, id: &str) -> Result<(), TaskManagerError> {
        Ok(self.tasks.remove(id).await?)
    }

    /// Remove several tasks, reporting failures per id
    pub async fn bulk_remove(&self, ids: &[String]) -> BulkRemoveResult {
        self.tasks.bulk_remove(ids).await
    }

    /// Stream of task lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn poller_state(&self) -> PollerState {
        *self.poller_state.borrow()
    }

    /// Watch poller state transitions
    pub fn watch_poller_state(&self) -> watch::Receiver<PollerState> {
        self.poller_state.clone()
    }

    pub fn managed_snapshot(&self) -> ManagedSnapshot {
        self.managed.snapshot()
    }

    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskTypeRegistry {
        &self.registry
    }

    /// Current health snapshot
    pub async fn health(&self) -> HealthSnapshot {
        let queue_depth = match self.tasks.count_claimable().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(error = %e, "Failed to count claimable tasks");
                None
            }
        };

        HealthSnapshot::from_inputs(HealthInputs {
            owner_id: self.config.owner_id.clone(),
            poller_state: self.poller_state(),
            queue_depth,
            capacity: self.capacity.usage(),
            configured_capacity: self.config.capacity,
            in_flight: self.pool.in_flight(),
            ephemeral: EphemeralHealth {
                enabled: self.ephemeral.is_enabled(),
                queue_depth: self.ephemeral.queue_depth(),
                capacity: self.ephemeral.capacity().usage(),
            },
            managed: self.managed.snapshot(),
            error_threshold: self.config.managed.error_threshold,
            cycles: self.monitoring.cycle_stats(),
            task_types: self.monitoring.task_stats(),
        })
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("owner_id", &self.config.owner_id)
            .field("registry", &self.registry)
            .field("poller_state", &self.poller_state())
            .finish()
    }
}
