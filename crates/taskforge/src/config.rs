//! Task manager configuration
//!
//! All durations serialize as milliseconds. `from_env` reads `TASKFORGE_*`
//! variables and falls back to the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors; all of them are fatal at startup
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The process identity used as `owner_id` was not supplied
    #[error("missing process identity (owner_id)")]
    MissingProcessIdentity,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Sliding window settings for the managed configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedSettings {
    /// Number of recent poll cycles considered
    pub window_size: usize,

    /// Errors within the window that trigger a capacity reduction
    pub error_threshold: usize,

    /// Consecutive successes needed before interval and capacity recover
    pub success_streak: u32,
}

impl Default for ManagedSettings {
    fn default() -> Self {
        Self {
            window_size: 10,
            error_threshold: 3,
            success_streak: 1,
        }
    }
}

/// Ephemeral lane settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EphemeralSettings {
    /// Whether `ephemeral_run_now` is accepted at all
    pub enabled: bool,

    /// Maximum queued (not yet started) requests
    pub queue_capacity: usize,

    /// Capacity units reserved for ephemeral runs
    pub capacity: u32,
}

impl Default for EphemeralSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: 10,
            capacity: 10,
        }
    }
}

/// Task manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskManagerConfig {
    /// Stable identifier of this process instance, written as `owner_id`
    pub owner_id: String,

    /// Default poll interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Poll interval ceiling while backing off
    #[serde(with = "duration_millis")]
    pub max_poll_interval: Duration,

    /// Worker capacity in cost units
    pub capacity: u32,

    /// Capacity floor under sustained errors
    pub min_capacity: u32,

    /// Lease granted between claim and start
    #[serde(with = "duration_millis")]
    pub claim_lease: Duration,

    /// How long shutdown waits for in-flight runs
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Capacity of the task event channel
    pub event_buffer: usize,

    pub managed: ManagedSettings,

    pub ephemeral: EphemeralSettings,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            poll_interval: Duration::from_secs(3),
            max_poll_interval: Duration::from_secs(60),
            capacity: 20,
            min_capacity: 2,
            claim_lease: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            event_buffer: 1024,
            managed: ManagedSettings::default(),
            ephemeral: EphemeralSettings::default(),
        }
    }
}

impl TaskManagerConfig {
    /// Create a configuration for the given process identity
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Recognized variables: `TASKFORGE_OWNER_ID`, `TASKFORGE_POLL_INTERVAL_MS`,
    /// `TASKFORGE_MAX_POLL_INTERVAL_MS`, `TASKFORGE_CAPACITY`,
    /// `TASKFORGE_MIN_CAPACITY`, `TASKFORGE_CLAIM_LEASE_MS`,
    /// `TASKFORGE_SHUTDOWN_TIMEOUT_MS`, `TASKFORGE_EPHEMERAL_ENABLED`,
    /// `TASKFORGE_EPHEMERAL_QUEUE`, `TASKFORGE_EPHEMERAL_CAPACITY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            owner_id: std::env::var("TASKFORGE_OWNER_ID").unwrap_or_default(),
            poll_interval: env_millis("TASKFORGE_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            max_poll_interval: env_millis("TASKFORGE_MAX_POLL_INTERVAL_MS")
                .unwrap_or(defaults.max_poll_interval),
            capacity: env_parse("TASKFORGE_CAPACITY").unwrap_or(defaults.capacity),
            min_capacity: env_parse("TASKFORGE_MIN_CAPACITY").unwrap_or(defaults.min_capacity),
            claim_lease: env_millis("TASKFORGE_CLAIM_LEASE_MS").unwrap_or(defaults.claim_lease),
            shutdown_timeout: env_millis("TASKFORGE_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout),
            ephemeral: EphemeralSettings {
                enabled: env_parse("TASKFORGE_EPHEMERAL_ENABLED")
                    .unwrap_or(defaults.ephemeral.enabled),
                queue_capacity: env_parse("TASKFORGE_EPHEMERAL_QUEUE")
                    .unwrap_or(defaults.ephemeral.queue_capacity),
                capacity: env_parse("TASKFORGE_EPHEMERAL_CAPACITY")
                    .unwrap_or(defaults.ephemeral.capacity),
            },
            ..defaults
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_min_capacity(mut self, capacity: u32) -> Self {
        self.min_capacity = capacity;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_managed(mut self, managed: ManagedSettings) -> Self {
        self.managed = managed;
        self
    }

    pub fn with_ephemeral(mut self, ephemeral: EphemeralSettings) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_id.trim().is_empty() {
            return Err(ConfigError::MissingProcessIdentity);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(ConfigError::Invalid(
                "max_poll_interval must not be below poll_interval".into(),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be positive".into()));
        }
        if self.min_capacity == 0 || self.min_capacity > self.capacity {
            return Err(ConfigError::Invalid(
                "min_capacity must be between 1 and capacity".into(),
            ));
        }
        if self.managed.window_size == 0 {
            return Err(ConfigError::Invalid("managed.window_size must be positive".into()));
        }
        if self.ephemeral.enabled && (self.ephemeral.queue_capacity == 0 || self.ephemeral.capacity == 0) {
            return Err(ConfigError::Invalid(
                "ephemeral queue_capacity and capacity must be positive when enabled".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TaskManagerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.capacity, 20);
        assert!(!config.ephemeral.enabled);
        // Identity must be supplied explicitly
        assert_eq!(config.validate(), Err(ConfigError::MissingProcessIdentity));
    }

    #[test]
    fn test_config_builder() {
        let config = TaskManagerConfig::new("node-1")
            .with_poll_interval(Duration::from_millis(50))
            .with_max_poll_interval(Duration::from_secs(1))
            .with_capacity(8)
            .with_min_capacity(1);

        assert_eq!(config.owner_id, "node-1");
        assert_eq!(config.capacity, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let config = TaskManagerConfig::new("node-1")
            .with_poll_interval(Duration::from_secs(10))
            .with_max_poll_interval(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = TaskManagerConfig::new("node-1")
            .with_capacity(4)
            .with_min_capacity(5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_serialization_uses_millis() {
        let config = TaskManagerConfig::new("node-1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], 3000);

        let parsed: TaskManagerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
