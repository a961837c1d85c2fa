//! Hub configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::LadderTimeouts;

/// Shortest accepted health check interval
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables of the sample-distribution and lifecycle subsystem
///
/// The defaults are empirically tuned; none of the exact values are load
/// bearing. Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Window within which a repeated non-restart start is absorbed
    #[serde(with = "millis")]
    pub debounce_window: Duration,

    /// Wait after a cooperative stop request before terminating
    #[serde(with = "millis")]
    pub graceful_timeout: Duration,

    /// Wait after terminate before killing
    #[serde(with = "millis")]
    pub terminate_timeout: Duration,

    /// Wait after kill before reporting the process unresponsive
    #[serde(with = "millis")]
    pub kill_timeout: Duration,

    /// Best-effort join when replacing a consumer of a different type
    #[serde(with = "millis")]
    pub replace_join_timeout: Duration,

    /// Interval between liveness checks while waiting for an exit
    #[serde(with = "millis")]
    pub exit_poll_interval: Duration,

    /// Start attempts made by a restart before giving up
    pub restart_attempts: u32,

    /// Backoff before the second restart attempt; doubles per attempt
    #[serde(with = "millis")]
    pub restart_backoff: Duration,

    /// Capacity of the worker → spectrum processor channel
    pub spectrum_queue_capacity: usize,

    /// Capacity of the worker → broadcaster channel
    pub broadcast_queue_capacity: usize,

    /// Capacity of each consumer's IQ subscription
    pub subscriber_queue_capacity: usize,

    /// Capacity of each audio subscription and demodulator output
    pub audio_queue_capacity: usize,

    /// How long to wait for the worker to acknowledge a configuration
    #[serde(with = "millis")]
    pub config_ack_timeout: Duration,

    /// Interval of the device health check
    #[serde(with = "millis")]
    pub health_check_interval: Duration,

    /// Chunks averaged per spectrum frame
    pub spectrum_average: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(250),
            graceful_timeout: Duration::from_secs(5),
            terminate_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_millis(200),
            replace_join_timeout: Duration::from_millis(200),
            exit_poll_interval: Duration::from_millis(10),
            restart_attempts: 3,
            restart_backoff: Duration::from_millis(100),
            spectrum_queue_capacity: 8,
            broadcast_queue_capacity: 32,
            subscriber_queue_capacity: 16,
            audio_queue_capacity: 32,
            config_ack_timeout: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(1),
            spectrum_average: 4,
        }
    }
}

impl HubConfig {
    /// Parse a JSON configuration; missing fields keep their defaults
    ///
    /// Out-of-range values are clamped the same way the builders clamp them.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::clamped)
    }

    /// Clamp fields whose zero value is meaningless
    pub fn clamped(mut self) -> Self {
        self.restart_attempts = self.restart_attempts.max(1);
        self.spectrum_queue_capacity = self.spectrum_queue_capacity.max(1);
        self.broadcast_queue_capacity = self.broadcast_queue_capacity.max(1);
        self.subscriber_queue_capacity = self.subscriber_queue_capacity.max(1);
        self.audio_queue_capacity = self.audio_queue_capacity.max(1);
        self.health_check_interval = self.health_check_interval.max(MIN_HEALTH_CHECK_INTERVAL);
        self.spectrum_average = self.spectrum_average.max(1);
        self
    }

    /// Set the debounce window
    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the three termination ladder timeouts
    pub fn termination_timeouts(mut self, graceful: Duration, terminate: Duration, kill: Duration) -> Self {
        self.graceful_timeout = graceful;
        self.terminate_timeout = terminate;
        self.kill_timeout = kill;
        self
    }

    /// Set restart attempts and initial backoff
    pub fn restart_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.restart_attempts = attempts.max(1);
        self.restart_backoff = backoff;
        self
    }

    /// Set the per-subscriber IQ queue capacity
    pub fn subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity.max(1);
        self
    }

    /// Set the health check interval
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval.max(MIN_HEALTH_CHECK_INTERVAL);
        self
    }

    /// Ladder used for cooperative shutdowns
    pub fn ladder(&self) -> LadderTimeouts {
        LadderTimeouts {
            graceful: self.graceful_timeout,
            terminate: self.terminate_timeout,
            kill: self.kill_timeout,
            poll: self.exit_poll_interval,
        }
    }

    /// Ladder used when replacing a consumer of a different type
    pub fn replace_ladder(&self) -> LadderTimeouts {
        LadderTimeouts {
            graceful: Duration::ZERO,
            terminate: self.replace_join_timeout,
            kill: self.replace_join_timeout,
            poll: self.exit_poll_interval,
        }
    }

    /// Backoff before restart attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.restart_backoff.saturating_mul(1 << shift)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();

        assert_eq!(config.debounce_window, Duration::from_millis(250));
        assert_eq!(config.graceful_timeout, Duration::from_secs(5));
        assert_eq!(config.terminate_timeout, Duration::from_secs(1));
        assert_eq!(config.kill_timeout, Duration::from_millis(200));
        assert_eq!(config.restart_attempts, 3);
    }

    #[test]
    fn test_from_json_partial() {
        let config = HubConfig::from_json(r#"{"debounce_window": 100, "restart_attempts": 5}"#).unwrap();

        assert_eq!(config.debounce_window, Duration::from_millis(100));
        assert_eq!(config.restart_attempts, 5);
        assert_eq!(config.graceful_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let json = serde_json::to_value(HubConfig::default()).unwrap();
        assert_eq!(json["kill_timeout"], 200);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = HubConfig::default().restart_policy(4, Duration::from_millis(50));

        assert_eq!(config.backoff_for(1), Duration::from_millis(50));
        assert_eq!(config.backoff_for(2), Duration::from_millis(100));
        assert_eq!(config.backoff_for(3), Duration::from_millis(200));
    }

    #[test]
    fn test_restart_attempts_at_least_one() {
        let config = HubConfig::default().restart_policy(0, Duration::ZERO);
        assert_eq!(config.restart_attempts, 1);
    }

    #[test]
    fn test_zero_health_interval_is_clamped() {
        let config = HubConfig::from_json(r#"{"health_check_interval": 0, "restart_attempts": 0}"#).unwrap();
        assert_eq!(config.health_check_interval, MIN_HEALTH_CHECK_INTERVAL);
        assert_eq!(config.restart_attempts, 1);

        let config = HubConfig::default().health_check_interval(Duration::ZERO);
        assert_eq!(config.health_check_interval, MIN_HEALTH_CHECK_INTERVAL);
    }

    #[test]
    fn test_builder_chaining() {
        let config = HubConfig::default()
            .debounce_window(Duration::from_millis(10))
            .termination_timeouts(
                Duration::from_millis(50),
                Duration::from_millis(20),
                Duration::from_millis(10),
            )
            .subscriber_queue_capacity(0)
            .health_check_interval(Duration::from_millis(30));

        let ladder = config.ladder();
        assert_eq!(ladder.graceful, Duration::from_millis(50));
        assert_eq!(ladder.terminate, Duration::from_millis(20));
        assert_eq!(ladder.kill, Duration::from_millis(10));
        assert_eq!(config.subscriber_queue_capacity, 1);
        assert_eq!(config.replace_ladder().graceful, Duration::ZERO);
    }
}
