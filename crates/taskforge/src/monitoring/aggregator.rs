//! Event-driven run statistics

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::events::TaskEvent;

/// Counters for one task type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskTypeStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub ephemeral_runs: u64,
    pub dropped: u64,
}

impl TaskTypeStats {
    /// Finished runs of either lane
    pub fn runs(&self) -> u64 {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Poll cycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub completed: u64,
    pub failed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Folds the event stream into counters read by health snapshots
#[derive(Default)]
pub struct MonitoringAggregator {
    by_type: DashMap<String, TaskTypeStats>,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
}

impl MonitoringAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume events until the channel closes
    pub fn spawn(self: &Arc<Self>, mut events: broadcast::Receiver<TaskEvent>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => aggregator.record(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Monitoring fell behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Monitoring aggregator stopped");
        })
    }

    pub fn record(&self, event: &TaskEvent) {
        match event {
            TaskEvent::PollCycleCompleted { .. } => {
                self.cycles_completed.fetch_add(1, Ordering::Relaxed);
                *self.last_cycle_at.lock() = Some(Utc::now());
            }
            TaskEvent::PollCycleFailed { .. } => {
                self.cycles_failed.fetch_add(1, Ordering::Relaxed);
                *self.last_cycle_at.lock() = Some(Utc::now());
            }
            _ => {
                let Some(task_type) = event.task_type() else {
                    return;
                };
                let mut stats = self.by_type.entry(task_type.to_string()).or_default();
                match event {
                    TaskEvent::TaskClaimed { .. } => stats.claimed += 1,
                    TaskEvent::TaskRunSucceeded { ephemeral, .. } => {
                        stats.succeeded += 1;
                        stats.ephemeral_runs += u64::from(*ephemeral);
                    }
                    TaskEvent::TaskRunFailed { ephemeral, .. } => {
                        stats.failed += 1;
                        stats.ephemeral_runs += u64::from(*ephemeral);
                    }
                    TaskEvent::TaskRunTimedOut { ephemeral, .. } => {
                        stats.timed_out += 1;
                        stats.ephemeral_runs += u64::from(*ephemeral);
                    }
                    TaskEvent::EphemeralTaskDropped { .. } => stats.dropped += 1,
                    TaskEvent::PollCycleCompleted { .. } | TaskEvent::PollCycleFailed { .. } => {}
                }
            }
        }
    }

    /// Per-type counters, sorted by type
    pub fn task_stats(&self) -> BTreeMap<String, TaskTypeStats> {
        self.by_type
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn cycle_stats(&self) -> CycleStats {
        CycleStats {
            completed: self.cycles_completed.load(Ordering::Relaxed),
            failed: self.cycles_failed.load(Ordering::Relaxed),
            last_cycle_at: *self.last_cycle_at.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::FailureKind;

    fn succeeded(task_type: &str, ephemeral: bool) -> TaskEvent {
        TaskEvent::TaskRunSucceeded {
            task_id: "t".into(),
            task_type: task_type.into(),
            ephemeral,
            duration_ms: 5,
            output: None,
        }
    }

    #[test]
    fn test_counts_per_task_type() {
        let aggregator = MonitoringAggregator::new();
        aggregator.record(&succeeded("a", false));
        aggregator.record(&succeeded("a", true));
        aggregator.record(&TaskEvent::TaskRunFailed {
            task_id: "t".into(),
            task_type: "b".into(),
            ephemeral: false,
            error: "boom".into(),
            kind: FailureKind::Run,
            will_retry: true,
        });

        let stats = aggregator.task_stats();
        assert_eq!(stats["a"].succeeded, 2);
        assert_eq!(stats["a"].ephemeral_runs, 1);
        assert_eq!(stats["b"].failed, 1);
        assert_eq!(stats["b"].runs(), 1);
    }

    #[test]
    fn test_cycle_counters() {
        let aggregator = MonitoringAggregator::new();
        assert!(aggregator.cycle_stats().last_cycle_at.is_none());

        aggregator.record(&TaskEvent::PollCycleCompleted {
            claimed: 1,
            conflicts: 0,
            skipped: 0,
        });
        aggregator.record(&TaskEvent::PollCycleFailed {
            error: "down".into(),
        });

        let cycles = aggregator.cycle_stats();
        assert_eq!(cycles.completed, 1);
        assert_eq!(cycles.failed, 1);
        assert!(cycles.last_cycle_at.is_some());
    }

    #[tokio::test]
    async fn test_spawned_aggregator_follows_channel() {
        let (tx, rx) = broadcast::channel(8);
        let aggregator = Arc::new(MonitoringAggregator::new());
        let handle = aggregator.spawn(rx);

        tx.send(succeeded("a", false)).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(aggregator.task_stats()["a"].succeeded, 1);
    }
}
