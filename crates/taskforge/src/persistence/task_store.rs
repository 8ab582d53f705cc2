//! Task persistence on top of a [`DocumentStore`]
//!
//! Every mutation is a version-checked update of a [`TaskDocument`]. The
//! claim protocol relies on nothing else: when two processes race for the
//! same document, the store accepts exactly one update and rejects the
//! other with [`StoreError::Conflict`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::{DocumentStore, Filter, SearchQuery, SortField, StoreError, Version};
use crate::engine::TaskTypeRegistry;
use crate::task::{Interval, TaskDefinition, TaskDocument, TaskRunResult, TaskStatus};
use crate::worker::{CapacityPermit, CapacityTracker};

/// Namespace for deterministic ids produced by `ensure_scheduled`
const TASK_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x1e, 0x5a, 0x72, 0x8f, 0x04, 0x4b, 0x6d, 0x9a, 0x21, 0x0e, 0xd7, 0x63, 0xb8, 0xf1, 0x45,
]);

/// Candidates fetched per claim pass, as a multiple of what could fit
///
/// Due tasks too large for the remaining capacity are skipped, so the page
/// must reach past them to the cheaper ones queued behind.
const CLAIM_FETCH_MULTIPLIER: u32 = 4;

/// Request to persist a new task
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Explicit id; a v7 UUID is generated when absent
    pub id: Option<String>,
    pub task_type: String,
    pub params: Value,
    pub run_state: Value,
    /// First run time; defaults to now
    pub run_at: Option<DateTime<Utc>>,
    pub interval: Option<Interval>,
}

impl ScheduleRequest {
    pub fn new(task_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            params,
            run_state: Value::Null,
            run_at: None,
            interval: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_run_state(mut self, run_state: Value) -> Self {
        self.run_state = run_state;
        self
    }

    fn into_document(self, id: String) -> TaskDocument {
        let mut task = TaskDocument::new(id, self.task_type, self.params);
        task.run_state = self.run_state;
        task.interval = self.interval;
        if let Some(run_at) = self.run_at {
            task.run_at = run_at;
        }
        task
    }
}

/// A task this process now owns, with its capacity already reserved
#[derive(Debug)]
pub struct ClaimedTask {
    pub task: TaskDocument,
    pub definition: Arc<TaskDefinition>,
    pub permit: CapacityPermit,
}

/// Result of one claim pass
#[derive(Debug, Default)]
pub struct ClaimOutcome {
    /// Claimed tasks in search order
    pub claimed: Vec<ClaimedTask>,

    /// Claimed tasks whose type is not registered; the caller fails them
    pub unrecognized: Vec<TaskDocument>,

    /// Candidates returned by the search
    pub candidates: usize,

    /// Claims lost to another process
    pub conflicts: usize,

    /// Candidates skipped for lack of capacity or concurrency
    pub skipped: usize,

    /// Undecodable documents moved to failed
    pub malformed: Vec<String>,
}

/// What completing a run did to the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Back to idle, due at `run_at`
    Rescheduled { run_at: DateTime<Utc> },
    /// One-shot task deleted
    Removed,
    /// Recurring task whose next run is out of range; failed terminally
    Unschedulable,
}

/// Outcome of a best-effort bulk removal
#[derive(Debug, Default)]
pub struct BulkRemoveResult {
    pub removed: Vec<String>,
    pub failed: Vec<(String, StoreError)>,
}

impl BulkRemoveResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Task persistence and claim protocol
pub struct TaskStore {
    store: Arc<dyn DocumentStore>,
    registry: Arc<TaskTypeRegistry>,
    claim_lease: Duration,
}

impl TaskStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<TaskTypeRegistry>,
        claim_lease: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            claim_lease,
        }
    }

    /// Deterministic id for a task type and params pair
    pub fn deterministic_id(task_type: &str, params: &Value) -> String {
        let key = format!("{}:{}", task_type, canonical_json(params));
        Uuid::new_v5(&TASK_ID_NAMESPACE, key.as_bytes()).to_string()
    }

    /// Persist a new task
    #[instrument(skip(self, request), fields(task_type = %request.task_type))]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<TaskDocument, StoreError> {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let mut task = request.into_document(id);

        task.version = self.store.create(&task.id, task.to_body()?).await?;
        debug!(task_id = %task.id, run_at = %task.run_at, "Task scheduled");
        Ok(task)
    }

    /// Schedule a task unless an equivalent one already exists
    ///
    /// Equivalence is the pair (task type, params). An existing task in
    /// any non-terminal state is returned as is; a terminally failed one
    /// is replaced by a fresh schedule under the same id.
    #[instrument(skip(self, request), fields(task_type = %request.task_type))]
    pub async fn ensure_scheduled(
        &self,
        request: ScheduleRequest,
    ) -> Result<TaskDocument, StoreError> {
        let id = Self::deterministic_id(&request.task_type, &request.params);

        match self.get(&id).await {
            Ok(existing) if !existing.is_terminal() => {
                debug!(task_id = %id, status = %existing.status, "Task already scheduled");
                Ok(existing)
            }
            Ok(existing) => {
                let mut task = request.into_document(id);
                task.attempts = existing.attempts;
                task.version = existing.version;
                self.save(&mut task).await?;
                debug!(task_id = %task.id, "Replaced terminally failed task");
                Ok(task)
            }
            Err(StoreError::NotFound(_)) => {
                let mut task = request.into_document(id.clone());
                match self.store.create(&id, task.to_body()?).await {
                    Ok(version) => {
                        task.version = version;
                        Ok(task)
                    }
                    // Lost a creation race; the winner's document stands
                    Err(StoreError::Conflict { .. }) => self.get(&id).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &str) -> Result<TaskDocument, StoreError> {
        TaskDocument::from_versioned(self.store.get(id).await?)
    }

    /// Run an arbitrary query against task documents
    pub async fn fetch(&self, query: &SearchQuery) -> Result<Vec<TaskDocument>, StoreError> {
        self.store
            .search(query)
            .await?
            .documents
            .into_iter()
            .map(TaskDocument::from_versioned)
            .collect()
    }

    /// Write a task back, refreshing its version on success
    pub async fn save(&self, task: &mut TaskDocument) -> Result<(), StoreError> {
        task.version = self
            .store
            .update(&task.id, task.to_body()?, task.version)
            .await?;
        Ok(())
    }

    /// Filter matching every task a poller may claim at `now`
    pub fn claimable_filter(now: DateTime<Utc>) -> Filter {
        let now_ms = now.timestamp_millis();
        Filter::Or(vec![
            Filter::And(vec![
                Filter::term("status", TaskStatus::Idle.as_str()),
                Filter::lte("run_at", now_ms),
            ]),
            Filter::And(vec![
                Filter::term("status", TaskStatus::Failed.as_str()),
                Filter::lte("retry_at", now_ms),
            ]),
            Filter::And(vec![
                Filter::terms(
                    "status",
                    [TaskStatus::Claiming.as_str(), TaskStatus::Running.as_str()],
                ),
                Filter::lte("retry_at", now_ms),
            ]),
        ])
    }

    /// Number of tasks claimable right now
    pub async fn count_claimable(&self) -> Result<usize, StoreError> {
        self.store.count(&Self::claimable_filter(Utc::now())).await
    }

    /// Claim due tasks for `owner_id`, reserving capacity from `capacity`
    ///
    /// Candidates are visited in `run_at` order. A candidate that does not
    /// fit the remaining capacity or its type's concurrency cap is left for
    /// a later cycle, and the pass moves on to the ones behind it. A lost
    /// race is skipped without retrying.
    #[instrument(skip(self, capacity), fields(owner_id = %owner_id))]
    pub async fn claim_available(
        &self,
        owner_id: &str,
        capacity: &Arc<CapacityTracker>,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = Utc::now();
        let min_cost = self.registry.min_cost().units().max(1);
        let fits = (capacity.available() / min_cost).max(1);
        let query = SearchQuery::new(Self::claimable_filter(now))
            .with_sort(SortField::asc("run_at"))
            .with_size(fits.saturating_mul(CLAIM_FETCH_MULTIPLIER) as usize);

        let page = self.store.search(&query).await?;
        let mut outcome = ClaimOutcome {
            candidates: page.documents.len(),
            ..Default::default()
        };

        for doc in page.documents {
            if capacity.available() < min_cost {
                break;
            }
            let id = doc.id.clone();
            let raw = doc.body.clone();
            let version = doc.version;

            let mut task = match TaskDocument::from_versioned(doc) {
                Ok(task) => task,
                Err(e) => {
                    error!(task_id = %id, error = %e, "Malformed task document");
                    if self.quarantine(&id, raw, version, &e.to_string()).await {
                        outcome.malformed.push(id);
                    }
                    continue;
                }
            };

            let definition = self.registry.get(&task.task_type).ok();
            let permit = match &definition {
                Some(def) => {
                    match capacity.try_reserve(&def.task_type, def.cost, def.max_concurrency) {
                        Some(permit) => Some(permit),
                        None => {
                            outcome.skipped += 1;
                            continue;
                        }
                    }
                }
                None => None,
            };

            match self.claim(&mut task, owner_id).await {
                Ok(()) => match (definition, permit) {
                    (Some(definition), Some(permit)) => outcome.claimed.push(ClaimedTask {
                        task,
                        definition,
                        permit,
                    }),
                    _ => outcome.unrecognized.push(task),
                },
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {
                    debug!(task_id = %task.id, "Claim lost to another owner");
                    outcome.conflicts += 1;
                }
                Err(e) if outcome.claimed.is_empty() && outcome.unrecognized.is_empty() => {
                    return Err(e);
                }
                Err(e) => {
                    // Keep what was already claimed; the rest waits for the next cycle
                    warn!(task_id = %task.id, error = %e, "Claim update failed");
                    break;
                }
            }
        }

        debug!(
            candidates = outcome.candidates,
            claimed = outcome.claimed.len(),
            conflicts = outcome.conflicts,
            skipped = outcome.skipped,
            "Claim pass finished"
        );
        Ok(outcome)
    }

    /// Take ownership of `task` for `owner_id` under a claim lease
    ///
    /// Fails with [`StoreError::Conflict`] when the document changed since
    /// `task` was read.
    pub async fn claim(&self, task: &mut TaskDocument, owner_id: &str) -> Result<(), StoreError> {
        task.status = TaskStatus::Claiming;
        task.owner_id = Some(owner_id.to_string());
        task.retry_at = Some(Utc::now() + lease(self.claim_lease));
        self.save(task).await
    }

    /// Move a claimed task to running and start its execution lease
    pub async fn mark_running(
        &self,
        task: &mut TaskDocument,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(now);
        task.retry_at = Some(now + lease(timeout));
        self.save(task).await
    }

    /// Record a successful run
    ///
    /// Recurring tasks and runs that asked for an explicit next run go
    /// back to idle; every other task is deleted.
    pub async fn complete(
        &self,
        task: &mut TaskDocument,
        result: &TaskRunResult,
    ) -> Result<Completion, StoreError> {
        if let Some(run_state) = &result.run_state {
            task.run_state = run_state.clone();
        }

        let next = match (result.run_at, task.interval) {
            (Some(run_at), _) => Some(run_at),
            (None, Some(interval)) => match interval.next_after(Utc::now()) {
                Some(run_at) => Some(run_at),
                None => {
                    let error = format!("next run after {interval} is out of range");
                    self.mark_failed(task, &error, None).await?;
                    return Ok(Completion::Unschedulable);
                }
            },
            (None, None) => None,
        };

        match next {
            Some(run_at) => {
                task.last_error = None;
                self.complete_recurring(task, run_at).await?;
                Ok(Completion::Rescheduled { run_at })
            }
            None => {
                self.store.delete(&task.id, Some(task.version)).await?;
                Ok(Completion::Removed)
            }
        }
    }

    /// Return a task to idle, due at `run_at`, with its owner cleared
    pub async fn complete_recurring(
        &self,
        task: &mut TaskDocument,
        run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        task.status = TaskStatus::Idle;
        task.run_at = run_at;
        task.owner_id = None;
        task.retry_at = None;
        task.started_at = None;
        task.failures = 0;
        self.save(task).await
    }

    /// Record a failed run
    ///
    /// With `retry_at` the task becomes claimable again at that time;
    /// without it the failure is terminal.
    pub async fn mark_failed(
        &self,
        task: &mut TaskDocument,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        task.status = TaskStatus::Failed;
        task.failures += 1;
        task.owner_id = None;
        task.retry_at = retry_at;
        task.last_error = Some(error.to_string());
        self.save(task).await
    }

    /// Hand a claimed but unstarted task back to the queue
    pub async fn release(&self, task: &mut TaskDocument) -> Result<(), StoreError> {
        task.status = TaskStatus::Idle;
        task.owner_id = None;
        task.retry_at = None;
        self.save(task).await
    }

    /// Delete a task regardless of its state
    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(id, None).await
    }

    /// Delete several tasks; one failure does not stop the rest
    pub async fn bulk_remove(&self, ids: &[String]) -> BulkRemoveResult {
        let mut result = BulkRemoveResult::default();
        for id in ids {
            match self.remove(id).await {
                Ok(()) => result.removed.push(id.clone()),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to remove task");
                    result.failed.push((id.clone(), e));
                }
            }
        }
        result
    }

    /// Mark an undecodable document as terminally failed so it stops
    /// matching the claim query
    async fn quarantine(
        &self,
        id: &str,
        mut body: Value,
        version: Version,
        reason: &str,
    ) -> bool {
        let Some(fields) = body.as_object_mut() else {
            return false;
        };
        fields.insert("status".into(), json!(TaskStatus::Failed.as_str()));
        fields.insert("retry_at".into(), Value::Null);
        fields.insert("owner_id".into(), Value::Null);
        fields.insert("last_error".into(), json!(reason));

        match self.store.update(id, body, version).await {
            Ok(_) => true,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to quarantine malformed task");
                false
            }
        }
    }
}

fn lease(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

/// JSON rendering with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect::<Map<String, Value>>(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}
