//! Retry delay policy for failed task runs

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// How long a failed task waits before it becomes claimable again
///
/// Supports exponential backoff with jitter to avoid thundering herd.
/// The attempt limit lives on the task definition; this policy only
/// decides the delay.
///
/// # Example
///
/// ```
/// use taskforge::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth per additional attempt (1.0 = fixed)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 30s, doubling, capped at 1 hour, 10% jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(3600),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// The same delay after every attempt
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying a task that has failed `attempts` times (1-based)
    pub fn delay_after_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Absolute retry time for a task that failed `attempts` times at `now`
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_after_attempt(attempts);
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }
}
