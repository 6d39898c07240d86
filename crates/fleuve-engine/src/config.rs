//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Configuration for one engine deployment.
///
/// Every long-running loop reads its knobs from here; per-adapter retry
/// policies override `retry_policy`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Events between state snapshots. 0 disables snapshotting (and with it
    /// truncation, which needs snapshots to be safe).
    pub snapshot_interval: u64,

    /// Whether the background truncator runs.
    pub enable_truncation: bool,

    /// Events younger than this are never truncated, so late side-effect
    /// consumers still observe them.
    #[serde(with = "duration_millis")]
    pub truncation_min_retention: Duration,

    /// Maximum events deleted per workflow per truncator visit.
    pub truncation_batch_size: usize,

    /// How often the truncator wakes up.
    #[serde(with = "duration_millis")]
    pub truncation_check_interval: Duration,

    /// Default retry policy for activity adapters.
    pub retry_policy: RetryPolicy,

    /// Sleep between empty reader polls.
    #[serde(with = "duration_millis")]
    pub reader_poll_interval: Duration,

    /// Maximum events per reader batch.
    pub reader_batch_size: usize,

    /// Sleep between delay-scheduler scans when nothing is due.
    #[serde(with = "duration_millis")]
    pub delay_poll_interval: Duration,

    /// Emit spans at the repository, reader, executor and delay boundaries.
    /// With no subscriber installed the spans are free either way.
    pub enable_tracing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 100,
            enable_truncation: false,
            truncation_min_retention: Duration::from_secs(24 * 60 * 60),
            truncation_batch_size: 500,
            truncation_check_interval: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
            reader_poll_interval: Duration::from_millis(200),
            reader_batch_size: 100,
            delay_poll_interval: Duration::from_secs(1),
            enable_tracing: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_truncation(mut self, enabled: bool) -> Self {
        self.enable_truncation = enabled;
        self
    }

    pub fn with_truncation_min_retention(mut self, retention: Duration) -> Self {
        self.truncation_min_retention = retention;
        self
    }

    pub fn with_truncation_batch_size(mut self, batch_size: usize) -> Self {
        self.truncation_batch_size = batch_size.max(1);
        self
    }

    pub fn with_truncation_check_interval(mut self, interval: Duration) -> Self {
        self.truncation_check_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_reader_poll_interval(mut self, interval: Duration) -> Self {
        self.reader_poll_interval = interval;
        self
    }

    pub fn with_reader_batch_size(mut self, batch_size: usize) -> Self {
        self.reader_batch_size = batch_size.max(1);
        self
    }

    pub fn with_delay_poll_interval(mut self, interval: Duration) -> Self {
        self.delay_poll_interval = interval;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }

    /// Whether snapshotting is on at all.
    pub fn snapshots_enabled(&self) -> bool {
        self.snapshot_interval > 0
    }
}

/// Serde support for Duration as milliseconds.
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
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.snapshot_interval, 100);
        assert!(!config.enable_truncation);
        assert!(config.snapshots_enabled());
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_snapshot_interval(0)
            .with_truncation(true)
            .with_reader_batch_size(0);

        assert!(!config.snapshots_enabled());
        assert!(config.enable_truncation);
        assert_eq!(config.reader_batch_size, 1);
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
