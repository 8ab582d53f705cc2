//! Persisted task documents

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::{StoreError, Version, VersionedDocument};

/// Lifecycle state of a persisted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `run_at`
    Idle,

    /// Claimed by a process instance, not yet started
    Claiming,

    /// Being executed by a worker
    Running,

    /// Last run failed; retried at `retry_at` if set, terminal otherwise
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest recurrence accepted when parsing
pub const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Recurrence interval such as `30s`, `5m`, `1h` or `1d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval(Duration);

impl Interval {
    /// Saturates at [`MAX_INTERVAL`]
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs).min(MAX_INTERVAL))
    }

    pub fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins.saturating_mul(60))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// One interval after `from`, or `None` past the representable range
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delta = chrono::Duration::from_std(self.0).ok()?;
        from.checked_add_signed(delta)
    }
}

/// Error parsing an [`Interval`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid interval {0:?}: expected <number><s|m|h|d>, at most 100 years")]
pub struct IntervalParseError(pub String);

impl FromStr for Interval {
    type Err = IntervalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IntervalParseError(s.to_string());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (digits, unit) = trimmed.split_at(split);

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        if value == 0 {
            return Err(invalid());
        }

        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            _ => return Err(invalid()),
        };

        value
            .checked_mul(multiplier)
            .filter(|secs| *secs <= MAX_INTERVAL.as_secs())
            .map(|secs| Self(Duration::from_secs(secs)))
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Interval {
    type Error = IntervalParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.to_string()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        match secs {
            s if s % 86_400 == 0 => write!(f, "{}d", s / 86_400),
            s if s % 3_600 == 0 => write!(f, "{}h", s / 3_600),
            s if s % 60 == 0 => write!(f, "{}m", s / 60),
            s => write!(f, "{}s", s),
        }
    }
}

/// A persisted unit of schedulable work
///
/// Timestamps are stored as epoch milliseconds so store range filters
/// compare them numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument {
    pub id: String,
    pub task_type: String,

    /// Opaque input supplied by the scheduler
    #[serde(default)]
    pub params: Value,

    /// Opaque state carried from one run to the next
    #[serde(default)]
    pub run_state: Value,

    pub status: TaskStatus,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub run_at: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scheduled_at: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub started_at: Option<DateTime<Utc>>,

    /// Total runs started; never decreases
    #[serde(default)]
    pub attempts: u32,

    /// Failed runs since the last success or reschedule
    #[serde(default)]
    pub failures: u32,

    #[serde(default)]
    pub owner_id: Option<String>,

    /// Lease expiry while claimed/running, next retry time while failed
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub retry_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub interval: Option<Interval>,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(skip)]
    pub version: Version,
}

impl TaskDocument {
    /// Build a new idle task
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            params,
            run_state: Value::Null,
            status: TaskStatus::Idle,
            run_at: now,
            scheduled_at: now,
            started_at: None,
            attempts: 0,
            failures: 0,
            owner_id: None,
            retry_at: None,
            interval: None,
            last_error: None,
            version: Version::default(),
        }
    }

    /// Decode a stored document, keeping its version
    pub fn from_versioned(doc: VersionedDocument) -> Result<Self, StoreError> {
        let mut task: TaskDocument = serde_json::from_value(doc.body)
            .map_err(|e| StoreError::Validation(format!("malformed task {}: {}", doc.id, e)))?;
        task.id = doc.id;
        task.version = doc.version;
        Ok(task)
    }

    /// Encode the document body (the version travels separately)
    pub fn to_body(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_recurring(&self) -> bool {
        self.interval.is_some()
    }

    /// Failed with no scheduled retry
    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_at.is_none()
    }

    /// Whether a poller may claim this task at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Idle => self.run_at <= now,
            TaskStatus::Failed => self.retry_at.is_some_and(|t| t <= now),
            TaskStatus::Claiming | TaskStatus::Running => self.lease_expired(now),
        }
    }

    /// Whether the current owner's lease has run out
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.owner_id.is_none() || self.retry_at.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interval_parse() {
        assert_eq!("30s".parse::<Interval>().unwrap(), Interval::from_secs(30));
        assert_eq!("5m".parse::<Interval>().unwrap(), Interval::from_mins(5));
        assert_eq!(
            "2h".parse::<Interval>().unwrap().as_duration(),
            Duration::from_secs(7200)
        );
        assert_eq!(
            "1d".parse::<Interval>().unwrap().as_duration(),
            Duration::from_secs(86_400)
        );

        assert!("".parse::<Interval>().is_err());
        assert!("5".parse::<Interval>().is_err());
        assert!("m".parse::<Interval>().is_err());
        assert!("0m".parse::<Interval>().is_err());
        assert!("5w".parse::<Interval>().is_err());
        assert!("100000000d".parse::<Interval>().is_err());
        assert!("36500d".parse::<Interval>().is_ok());
        assert!("36501d".parse::<Interval>().is_err());
    }

    #[test]
    fn test_interval_next_run_is_bounded() {
        assert_eq!(Interval::from_secs(u64::MAX).as_duration(), MAX_INTERVAL);

        let now = Utc::now();
        assert_eq!(
            Interval::from_secs(60).next_after(now),
            Some(now + chrono::Duration::seconds(60))
        );
        assert!(Interval::from_secs(u64::MAX).next_after(now).is_some());
        assert_eq!(Interval::from_secs(60).next_after(DateTime::<Utc>::MAX_UTC), None);
    }

    #[test]
    fn test_stored_oversized_interval_is_validation_error() {
        let mut body = TaskDocument::new("t1", "report", json!({})).to_body().unwrap();
        body["interval"] = json!("100000000d");

        let result = TaskDocument::from_versioned(VersionedDocument {
            id: "t1".into(),
            body,
            version: Version(1),
        });
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_interval_display_uses_largest_unit() {
        assert_eq!(Interval::from_secs(90).to_string(), "90s");
        assert_eq!(Interval::from_secs(300).to_string(), "5m");
        assert_eq!(Interval::from_secs(7200).to_string(), "2h");
    }

    #[test]
    fn test_document_round_trip_keeps_version() {
        let mut task = TaskDocument::new("t1", "report", json!({"n": 1}));
        task.interval = Some(Interval::from_mins(5));

        let body = task.to_body().unwrap();
        assert_eq!(body["interval"], json!("5m"));
        assert_eq!(body["status"], json!("idle"));
        assert!(body["run_at"].is_i64());
        assert!(body.get("version").is_none());

        let decoded = TaskDocument::from_versioned(VersionedDocument {
            id: "t1".into(),
            body,
            version: Version(7),
        })
        .unwrap();
        assert_eq!(decoded.version, Version(7));
        assert_eq!(decoded.interval, task.interval);
    }

    #[test]
    fn test_malformed_document_is_validation_error() {
        let result = TaskDocument::from_versioned(VersionedDocument {
            id: "bad".into(),
            body: json!({"task_type": 5}),
            version: Version(1),
        });
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn test_claimability() {
        let now = Utc::now();
        let mut task = TaskDocument::new("t1", "report", json!({}));
        task.run_at = now + chrono::Duration::seconds(10);
        assert!(!task.is_claimable(now));

        task.run_at = now;
        assert!(task.is_claimable(now));

        task.status = TaskStatus::Running;
        task.owner_id = Some("other".into());
        task.retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!task.is_claimable(now));

        // Lease expired
        task.retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(task.is_claimable(now));

        task.status = TaskStatus::Failed;
        task.retry_at = None;
        assert!(task.is_terminal());
        assert!(!task.is_claimable(now));
    }
}
