// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Engine configuration.
//!
//! All tunables of the engine live in one [`EngineConfig`] value that is
//! built once by the host and handed to the registry. Nothing is read from
//! global state afterwards.
//!
//! ```text
//! PublisherConfig
//! ├── engine     EngineConfig      timeouts, backoff, keep-alive, defaults
//! └── endpoints  [EndpointConfig]  endpoint security and nodes to publish
//! ```

mod loader;
mod published;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, PublisherResult};
use crate::types::StatusCode;

pub use loader::{ConfigFormat, ConfigLoader};
pub use published::{EndpointConfig, NodeConfig, PublisherConfig};

/// Upper bound for heartbeat intervals.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// EngineConfig
// =============================================================================

/// Tunables of the reconciliation engine.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use opcpub_engine::settings::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .session_timeout(Duration::from_secs(5))
///     .max_backoff_steps(3)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.connect_timeout_for(0), Duration::from_secs(5));
/// assert_eq!(config.connect_timeout_for(7), Duration::from_secs(15));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base timeout for creating a session.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Cap on the multiplier applied to `session_timeout` after failures.
    pub max_backoff_steps: u32,

    /// Idle wait of the reconciliation loop between passes.
    #[serde(with = "humantime_serde")]
    pub session_connect_wait: Duration,

    /// Keep-alive interval requested from the stack.
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// Consecutive bad keep-alives that force a disconnect.
    pub keep_alive_disconnect_threshold: u32,

    /// Publishing interval used when a node does not specify one.
    #[serde(with = "humantime_serde")]
    pub default_publishing_interval: Duration,

    /// Sampling interval used when a node does not specify one.
    #[serde(with = "humantime_serde")]
    pub default_sampling_interval: Duration,

    /// Heartbeat interval used when a node does not specify one.
    #[serde(with = "humantime_serde")]
    pub default_heartbeat_interval: Duration,

    /// Skip-first flag used when a node does not specify one.
    pub default_skip_first: bool,

    /// Read the DisplayName attribute of nodes without a configured name.
    pub fetch_display_name: bool,

    /// Server-side queue size of monitored items.
    pub queue_size: u32,

    /// Items added between two apply-changes round trips.
    pub apply_batch_size: usize,

    /// Notifications with these status codes are dropped.
    pub suppressed_status_codes: Vec<StatusCode>,

    /// Give up on a node after this many per-node failures. `None` retries forever.
    pub max_node_attempts: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            max_backoff_steps: 5,
            session_connect_wait: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(2),
            keep_alive_disconnect_threshold: 5,
            default_publishing_interval: Duration::from_secs(1),
            default_sampling_interval: Duration::from_secs(1),
            default_heartbeat_interval: Duration::ZERO,
            default_skip_first: false,
            fetch_display_name: false,
            queue_size: 0,
            apply_batch_size: 10_000,
            suppressed_status_codes: Vec::new(),
            max_node_attempts: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Returns the connect timeout after `unsuccessful` failed attempts.
    ///
    /// Grows linearly with the failure count and plateaus at
    /// `max_backoff_steps * session_timeout`.
    pub fn connect_timeout_for(&self, unsuccessful: u32) -> Duration {
        let steps = unsuccessful
            .saturating_add(1)
            .min(self.max_backoff_steps.max(1));
        self.session_timeout.saturating_mul(steps)
    }

    /// Returns `true` if notifications with this status are dropped.
    pub fn is_suppressed(&self, status: StatusCode) -> bool {
        self.suppressed_status_codes.contains(&status)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> PublisherResult<()> {
        if self.session_timeout.is_zero() {
            return Err(invalid("session_timeout", "must be greater than zero"));
        }
        if self.max_backoff_steps == 0 {
            return Err(invalid("max_backoff_steps", "must be at least 1"));
        }
        if self.session_connect_wait.is_zero() {
            return Err(invalid("session_connect_wait", "must be greater than zero"));
        }
        if self.keep_alive_disconnect_threshold == 0 {
            return Err(invalid(
                "keep_alive_disconnect_threshold",
                "must be at least 1",
            ));
        }
        if self.apply_batch_size == 0 {
            return Err(invalid("apply_batch_size", "must be at least 1"));
        }
        if self.default_heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            return Err(invalid("default_heartbeat_interval", "must not exceed 24h"));
        }
        if self.max_node_attempts == Some(0) {
            return Err(invalid("max_node_attempts", "must be at least 1 when set"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::PublisherError {
    ConfigurationError::invalid_value(field, reason).into()
}

// =============================================================================
// EngineConfigBuilder
// =============================================================================

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the base session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Sets the backoff cap.
    pub fn max_backoff_steps(mut self, steps: u32) -> Self {
        self.config.max_backoff_steps = steps;
        self
    }

    /// Sets the idle wait between reconciliation passes.
    pub fn session_connect_wait(mut self, wait: Duration) -> Self {
        self.config.session_connect_wait = wait;
        self
    }

    /// Sets the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    /// Sets the keep-alive disconnect threshold.
    pub fn keep_alive_disconnect_threshold(mut self, threshold: u32) -> Self {
        self.config.keep_alive_disconnect_threshold = threshold;
        self
    }

    /// Sets the default publishing interval.
    pub fn default_publishing_interval(mut self, interval: Duration) -> Self {
        self.config.default_publishing_interval = interval;
        self
    }

    /// Sets the default sampling interval.
    pub fn default_sampling_interval(mut self, interval: Duration) -> Self {
        self.config.default_sampling_interval = interval;
        self
    }

    /// Sets the default heartbeat interval.
    pub fn default_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.default_heartbeat_interval = interval;
        self
    }

    /// Sets the default skip-first flag.
    pub fn default_skip_first(mut self, skip: bool) -> Self {
        self.config.default_skip_first = skip;
        self
    }

    /// Enables reading display names from the server.
    pub fn fetch_display_name(mut self, enabled: bool) -> Self {
        self.config.fetch_display_name = enabled;
        self
    }

    /// Sets the apply batch size.
    pub fn apply_batch_size(mut self, size: usize) -> Self {
        self.config.apply_batch_size = size;
        self
    }

    /// Adds a suppressed status code.
    pub fn suppress_status(mut self, status: StatusCode) -> Self {
        self.config.suppressed_status_codes.push(status);
        self
    }

    /// Sets the per-node attempt limit.
    pub fn max_node_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.max_node_attempts = attempts;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> PublisherResult<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// =============================================================================
// humantime_serde helper
// =============================================================================

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| humantime::format_duration(d).to_string())
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.apply_batch_size, 10_000);
        assert_eq!(config.max_node_attempts, None);
    }

    #[test]
    fn test_backoff_grows_then_plateaus() {
        let config = EngineConfig::builder()
            .session_timeout(Duration::from_secs(10))
            .max_backoff_steps(5)
            .build()
            .unwrap();

        let timeouts: Vec<Duration> = (0..10).map(|n| config.connect_timeout_for(n)).collect();
        assert!(timeouts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(timeouts[0], Duration::from_secs(10));
        assert_eq!(timeouts[4], Duration::from_secs(50));
        assert_eq!(timeouts[9], Duration::from_secs(50));
        assert_eq!(config.connect_timeout_for(u32::MAX), Duration::from_secs(50));
    }

    #[test]
    fn test_builder_rejects_invalid_values() {
        assert!(EngineConfig::builder().max_backoff_steps(0).build().is_err());
        assert!(EngineConfig::builder().apply_batch_size(0).build().is_err());
        assert!(EngineConfig::builder()
            .keep_alive_disconnect_threshold(0)
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .max_node_attempts(Some(0))
            .build()
            .is_err());
        assert!(EngineConfig::builder()
            .default_heartbeat_interval(Duration::from_secs(25 * 3600))
            .build()
            .is_err());
    }

    #[test]
    fn test_serde_humantime_round_trip() {
        let config = EngineConfig::builder()
            .session_connect_wait(Duration::from_millis(1500))
            .suppress_status(StatusCode::BAD_NODE_ID_UNKNOWN)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"1s 500ms\""));
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert!(back.is_suppressed(StatusCode::BAD_NODE_ID_UNKNOWN));
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "session_timeout": "3s", "max_node_attempts": 4 }"#)
                .unwrap();
        assert_eq!(config.session_timeout, Duration::from_secs(3));
        assert_eq!(config.max_node_attempts, Some(4));
        assert_eq!(config.keep_alive_disconnect_threshold, 5);
    }
}
