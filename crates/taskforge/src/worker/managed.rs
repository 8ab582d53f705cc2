//! Managed configuration
//!
//! Backpressure control loop that adjusts the poll interval and worker
//! capacity from a sliding window of recent poll-cycle outcomes. It never
//! blocks; the lifecycles read a [`ManagedSnapshot`] before each cycle, and
//! capacity changes are also published on a `watch` channel.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ManagedSettings, TaskManagerConfig};

/// Outcome of one poll cycle (or of a store write made on its behalf)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    Error,
}

/// Bounds the throttle policy works within
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleLimits {
    pub default_interval: Duration,
    pub max_interval: Duration,
    pub default_capacity: u32,
    pub min_capacity: u32,
}

impl ThrottleLimits {
    pub fn from_config(config: &TaskManagerConfig) -> Self {
        Self {
            default_interval: config.poll_interval,
            max_interval: config.max_poll_interval,
            default_capacity: config.capacity,
            min_capacity: config.min_capacity,
        }
    }
}

/// Growth/decay curve for the poll interval and capacity
///
/// Implementations must keep results within `limits`.
pub trait ThrottlePolicy: Send + Sync + fmt::Debug {
    /// Interval after the `consecutive_errors`-th error in a row
    fn interval_after_error(
        &self,
        current: Duration,
        consecutive_errors: u32,
        limits: &ThrottleLimits,
    ) -> Duration;

    /// Interval after a success streak
    fn interval_after_success(&self, current: Duration, limits: &ThrottleLimits) -> Duration;

    /// Capacity while the error window is over its threshold
    fn capacity_under_pressure(&self, current: u32, limits: &ThrottleLimits) -> u32;

    /// Capacity after a success streak with the window under its threshold
    fn capacity_after_success(&self, current: u32, limits: &ThrottleLimits) -> u32;
}

/// Multiplicative growth and decay
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialThrottle {
    /// Interval multiplier per consecutive error
    pub interval_growth: f64,
    /// Interval divisor per success streak
    pub interval_decay: f64,
    /// Capacity multiplier under pressure
    pub capacity_shrink: f64,
    /// Capacity multiplier on recovery
    pub capacity_growth: f64,
}

impl Default for ExponentialThrottle {
    fn default() -> Self {
        Self {
            interval_growth: 2.0,
            interval_decay: 1.2,
            capacity_shrink: 0.8,
            capacity_growth: 1.05,
        }
    }
}

impl ThrottlePolicy for ExponentialThrottle {
    fn interval_after_error(
        &self,
        current: Duration,
        _consecutive_errors: u32,
        limits: &ThrottleLimits,
    ) -> Duration {
        let grown = current.as_secs_f64() * self.interval_growth.max(1.0);
        Duration::from_secs_f64(grown).clamp(limits.default_interval, limits.max_interval)
    }

    fn interval_after_success(&self, current: Duration, limits: &ThrottleLimits) -> Duration {
        let decayed = current.as_secs_f64() / self.interval_decay.max(1.0);
        Duration::from_secs_f64(decayed).clamp(limits.default_interval, limits.max_interval)
    }

    fn capacity_under_pressure(&self, current: u32, limits: &ThrottleLimits) -> u32 {
        let shrunk = (current as f64 * self.capacity_shrink).floor() as u32;
        shrunk
            .min(current.saturating_sub(1))
            .max(limits.min_capacity)
    }

    fn capacity_after_success(&self, current: u32, limits: &ThrottleLimits) -> u32 {
        let grown = (current as f64 * self.capacity_growth).ceil() as u32;
        grown.max(current + 1).min(limits.default_capacity)
    }
}

/// Point-in-time view consumed before each cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedSnapshot {
    #[serde(rename = "poll_interval_ms", serialize_with = "serialize_millis")]
    pub poll_interval: Duration,
    pub capacity: u32,
    pub consecutive_errors: u32,
    pub window_errors: usize,
    pub window_len: usize,
}

impl ManagedSnapshot {
    /// Share of errors within the window
    pub fn error_rate(&self) -> f64 {
        if self.window_len == 0 {
            0.0
        } else {
            self.window_errors as f64 / self.window_len as f64
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

struct ManagedState {
    window: VecDeque<CycleOutcome>,
    consecutive_errors: u32,
    consecutive_successes: u32,
    poll_interval: Duration,
    capacity: u32,
}

/// Runtime-adjustable poll interval and capacity
///
/// The window and the derived values are updated under one mutex, so
/// concurrent reporters are serialized.
pub struct ManagedConfiguration {
    settings: ManagedSettings,
    limits: ThrottleLimits,
    policy: Box<dyn ThrottlePolicy>,
    state: Mutex<ManagedState>,
    capacity_tx: watch::Sender<u32>,
}

impl ManagedConfiguration {
    /// Create with the default exponential policy
    pub fn new(config: &TaskManagerConfig) -> Self {
        Self::with_policy(config, Box::new(ExponentialThrottle::default()))
    }

    /// Create with a custom growth/decay policy
    pub fn with_policy(config: &TaskManagerConfig, policy: Box<dyn ThrottlePolicy>) -> Self {
        let limits = ThrottleLimits::from_config(config);
        let (capacity_tx, _) = watch::channel(limits.default_capacity);
        Self {
            settings: config.managed.clone(),
            state: Mutex::new(ManagedState {
                window: VecDeque::with_capacity(config.managed.window_size),
                consecutive_errors: 0,
                consecutive_successes: 0,
                poll_interval: limits.default_interval,
                capacity: limits.default_capacity,
            }),
            limits,
            policy,
            capacity_tx,
        }
    }

    /// Record a cycle outcome and return the updated snapshot
    pub fn record(&self, outcome: CycleOutcome) -> ManagedSnapshot {
        let mut state = self.state.lock();

        if state.window.len() >= self.settings.window_size {
            state.window.pop_front();
        }
        state.window.push_back(outcome);
        let window_errors = count_errors(&state.window);
        let under_pressure = window_errors >= self.settings.error_threshold;

        match outcome {
            CycleOutcome::Error => {
                state.consecutive_errors += 1;
                state.consecutive_successes = 0;

                let previous = state.poll_interval;
                state.poll_interval = self.policy.interval_after_error(
                    previous,
                    state.consecutive_errors,
                    &self.limits,
                );
                if state.poll_interval != previous {
                    warn!(
                        interval_ms = state.poll_interval.as_millis() as u64,
                        consecutive_errors = state.consecutive_errors,
                        "Poll interval increased after store errors"
                    );
                }

                if under_pressure {
                    let previous = state.capacity;
                    state.capacity = self.policy.capacity_under_pressure(previous, &self.limits);
                    if state.capacity != previous {
                        warn!(
                            capacity = state.capacity,
                            window_errors, "Worker capacity reduced under error pressure"
                        );
                    }
                }
            }
            CycleOutcome::Success => {
                state.consecutive_errors = 0;
                state.consecutive_successes += 1;

                if state.consecutive_successes >= self.settings.success_streak {
                    let previous = state.poll_interval;
                    state.poll_interval =
                        self.policy.interval_after_success(previous, &self.limits);
                    if state.poll_interval != previous {
                        debug!(
                            interval_ms = state.poll_interval.as_millis() as u64,
                            "Poll interval decaying toward default"
                        );
                    }

                    if !under_pressure && state.capacity < self.limits.default_capacity {
                        state.capacity =
                            self.policy.capacity_after_success(state.capacity, &self.limits);
                        info!(capacity = state.capacity, "Worker capacity recovering");
                    }
                }
            }
        }

        let capacity = state.capacity;
        self.capacity_tx.send_if_modified(|current| {
            let changed = *current != capacity;
            *current = capacity;
            changed
        });

        snapshot_of(&state, window_errors)
    }

    pub fn record_success(&self) -> ManagedSnapshot {
        self.record(CycleOutcome::Success)
    }

    pub fn record_error(&self) -> ManagedSnapshot {
        self.record(CycleOutcome::Error)
    }

    /// Current poll interval and capacity
    pub fn snapshot(&self) -> ManagedSnapshot {
        let state = self.state.lock();
        snapshot_of(&state, count_errors(&state.window))
    }

    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    /// Follow capacity changes as they are made
    pub fn watch_capacity(&self) -> watch::Receiver<u32> {
        self.capacity_tx.subscribe()
    }
}

impl fmt::Debug for ManagedConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConfiguration")
            .field("limits", &self.limits)
            .field("policy", &self.policy)
            .finish()
    }
}

fn count_errors(window: &VecDeque<CycleOutcome>) -> usize {
    window.iter().filter(|o| **o == CycleOutcome::Error).count()
}

fn snapshot_of(state: &ManagedState, window_errors: usize) -> ManagedSnapshot {
    ManagedSnapshot {
        poll_interval: state.poll_interval,
        capacity: state.capacity,
        consecutive_errors: state.consecutive_errors,
        window_errors,
        window_len: state.window.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TaskManagerConfig {
        TaskManagerConfig::new("test")
            .with_poll_interval(Duration::from_millis(100))
            .with_max_poll_interval(Duration::from_secs(2))
            .with_capacity(20)
            .with_min_capacity(4)
    }

    #[test]
    fn test_starts_at_defaults() {
        let managed = ManagedConfiguration::new(&config());
        let snapshot = managed.snapshot();
        assert_eq!(snapshot.poll_interval, Duration::from_millis(100));
        assert_eq!(snapshot.capacity, 20);
        assert_eq!(snapshot.error_rate(), 0.0);
    }

    #[test]
    fn test_interval_strictly_increases_until_max() {
        let managed = ManagedConfiguration::new(&config());
        let mut previous = managed.snapshot().poll_interval;

        // 100ms doubles 4 times before hitting the 2s cap
        for _ in 0..4 {
            let current = managed.record_error().poll_interval;
            assert!(current > previous);
            previous = current;
        }

        for _ in 0..3 {
            assert_eq!(managed.record_error().poll_interval, Duration::from_secs(2));
        }
    }

    #[test]
    fn test_interval_decays_after_success() {
        let managed = ManagedConfiguration::new(&config());
        for _ in 0..5 {
            managed.record_error();
        }
        let backed_off = managed.snapshot().poll_interval;

        let after_one = managed.record_success().poll_interval;
        assert!(after_one < backed_off);

        for _ in 0..50 {
            managed.record_success();
        }
        assert_eq!(managed.snapshot().poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_success_streak_delays_decay() {
        let mut cfg = config();
        cfg.managed.success_streak = 3;
        let managed = ManagedConfiguration::new(&cfg);

        managed.record_error();
        let backed_off = managed.snapshot().poll_interval;

        assert_eq!(managed.record_success().poll_interval, backed_off);
        assert_eq!(managed.record_success().poll_interval, backed_off);
        assert!(managed.record_success().poll_interval < backed_off);
    }

    #[test]
    fn test_capacity_shrinks_under_pressure_and_recovers() {
        let managed = ManagedConfiguration::new(&config());

        // Below the error threshold (3) capacity is untouched
        managed.record_error();
        managed.record_error();
        assert_eq!(managed.snapshot().capacity, 20);

        let shrunk = managed.record_error().capacity;
        assert_eq!(shrunk, 16);

        for _ in 0..20 {
            managed.record_error();
        }
        assert_eq!(managed.snapshot().capacity, 4);

        // Flush the window, then recover gradually
        for _ in 0..10 {
            managed.record_success();
        }
        let recovering = managed.snapshot().capacity;
        assert!(recovering > 4);
        assert!(recovering < 20);

        for _ in 0..100 {
            managed.record_success();
        }
        assert_eq!(managed.snapshot().capacity, 20);
    }

    #[test]
    fn test_capacity_changes_are_published() {
        let managed = ManagedConfiguration::new(&config());
        let mut capacity = managed.watch_capacity();
        assert_eq!(*capacity.borrow_and_update(), 20);

        managed.record_error();
        managed.record_error();
        assert!(!capacity.has_changed().unwrap());

        managed.record_error();
        assert!(capacity.has_changed().unwrap());
        assert_eq!(*capacity.borrow_and_update(), 16);
    }

    #[test]
    fn test_window_is_bounded() {
        let managed = ManagedConfiguration::new(&config());
        for _ in 0..25 {
            managed.record_success();
        }
        let snapshot = managed.snapshot();
        assert_eq!(snapshot.window_len, 10);
        assert_eq!(snapshot.window_errors, 0);
    }

    #[derive(Debug)]
    struct LinearThrottle;

    impl ThrottlePolicy for LinearThrottle {
        fn interval_after_error(
            &self,
            _current: Duration,
            consecutive_errors: u32,
            limits: &ThrottleLimits,
        ) -> Duration {
            (limits.default_interval * (consecutive_errors + 1)).min(limits.max_interval)
        }

        fn interval_after_success(&self, _current: Duration, limits: &ThrottleLimits) -> Duration {
            limits.default_interval
        }

        fn capacity_under_pressure(&self, _current: u32, limits: &ThrottleLimits) -> u32 {
            limits.min_capacity
        }

        fn capacity_after_success(&self, _current: u32, limits: &ThrottleLimits) -> u32 {
            limits.default_capacity
        }
    }

    #[test]
    fn test_pluggable_policy() {
        let managed = ManagedConfiguration::with_policy(&config(), Box::new(LinearThrottle));

        assert_eq!(managed.record_error().poll_interval, Duration::from_millis(200));
        assert_eq!(managed.record_error().poll_interval, Duration::from_millis(300));
        assert_eq!(managed.record_success().poll_interval, Duration::from_millis(100));
    }
}
