//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Default number of messages kept in the bus history.
pub const DEFAULT_MESSAGE_HISTORY_LIMIT: usize = 100;

/// Default size of the global error log.
pub const DEFAULT_ERROR_LOG_LIMIT: usize = 50;

/// Default number of errors kept per instance.
pub const DEFAULT_INSTANCE_ERROR_LIMIT: usize = 5;

/// Default number of lifecycle events kept per instance.
pub const DEFAULT_INSTANCE_EVENT_LIMIT: usize = 20;

/// Default concurrency for refresh and mount fan-out.
pub const DEFAULT_MAX_PARALLEL_REFRESH: usize = 8;

/// Configuration for the widget orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Messages retained in the rolling bus history
    pub message_history_limit: usize,
    /// Records retained in the global error log
    pub error_log_limit: usize,
    /// Errors retained on each instance
    pub instance_error_limit: usize,
    /// Lifecycle events retained on each instance
    pub instance_event_limit: usize,
    /// Maximum concurrent cycles during `refresh_all` / `mount_all`
    pub max_parallel_refresh: usize,
    /// Abandon a mount/refresh/sync cycle after this many milliseconds.
    /// `None` waits for the driver indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_timeout_ms: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            message_history_limit: DEFAULT_MESSAGE_HISTORY_LIMIT,
            error_log_limit: DEFAULT_ERROR_LOG_LIMIT,
            instance_error_limit: DEFAULT_INSTANCE_ERROR_LIMIT,
            instance_event_limit: DEFAULT_INSTANCE_EVENT_LIMIT,
            max_parallel_refresh: DEFAULT_MAX_PARALLEL_REFRESH,
            mount_timeout_ms: None,
        }
    }
}

impl OrchestratorConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads `WIDGET_MESSAGE_HISTORY`, `WIDGET_ERROR_LOG`,
    /// `WIDGET_MAX_PARALLEL_REFRESH` and `WIDGET_MOUNT_TIMEOUT_MS`; anything
    /// unset or unparsable keeps its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            message_history_limit: env_parse("WIDGET_MESSAGE_HISTORY")
                .unwrap_or(defaults.message_history_limit),
            error_log_limit: env_parse("WIDGET_ERROR_LOG").unwrap_or(defaults.error_log_limit),
            max_parallel_refresh: env_parse("WIDGET_MAX_PARALLEL_REFRESH")
                .unwrap_or(defaults.max_parallel_refresh),
            mount_timeout_ms: env_parse("WIDGET_MOUNT_TIMEOUT_MS"),
            ..defaults
        }
        .normalized()
    }

    /// Set the bus history limit.
    pub fn with_message_history_limit(mut self, limit: usize) -> Self {
        self.message_history_limit = limit;
        self
    }

    /// Set the global error log limit.
    pub fn with_error_log_limit(mut self, limit: usize) -> Self {
        self.error_log_limit = limit;
        self
    }

    /// Set the per-instance error limit.
    pub fn with_instance_error_limit(mut self, limit: usize) -> Self {
        self.instance_error_limit = limit;
        self
    }

    /// Set the per-instance event limit.
    pub fn with_instance_event_limit(mut self, limit: usize) -> Self {
        self.instance_event_limit = limit;
        self
    }

    /// Set the fan-out concurrency (at least 1).
    pub fn with_max_parallel_refresh(mut self, max: usize) -> Self {
        self.max_parallel_refresh = max.max(1);
        self
    }

    /// Set a cycle timeout.
    pub fn with_mount_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.mount_timeout_ms = Some(timeout_ms);
        self
    }

    /// Cycle timeout as a `Duration`.
    pub fn mount_timeout(&self) -> Option<Duration> {
        self.mount_timeout_ms.map(Duration::from_millis)
    }

    /// Clamp limits that must be at least 1.
    pub fn normalized(mut self) -> Self {
        self.message_history_limit = self.message_history_limit.max(1);
        self.error_log_limit = self.error_log_limit.max(1);
        self.instance_error_limit = self.instance_error_limit.max(1);
        self.instance_event_limit = self.instance_event_limit.max(1);
        self.max_parallel_refresh = self.max_parallel_refresh.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.message_history_limit, 100);
        assert_eq!(config.error_log_limit, 50);
        assert_eq!(config.instance_error_limit, 5);
        assert_eq!(config.instance_event_limit, 20);
        assert!(config.mount_timeout().is_none());
    }

    #[test]
    fn test_builder() {
        let config = OrchestratorConfig::default()
            .with_message_history_limit(10)
            .with_max_parallel_refresh(0)
            .with_mount_timeout_ms(250);

        assert_eq!(config.message_history_limit, 10);
        assert_eq!(config.max_parallel_refresh, 1);
        assert_eq!(config.mount_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"message_history_limit": 25}"#).unwrap();
        assert_eq!(
            config,
            OrchestratorConfig {
                message_history_limit: 25,
                ..OrchestratorConfig::default()
            }
        );
    }

    #[test]
    fn test_normalized() {
        let config = OrchestratorConfig {
            message_history_limit: 0,
            instance_event_limit: 0,
            ..OrchestratorConfig::default()
        }
        .normalized();
        assert_eq!(config.message_history_limit, 1);
        assert_eq!(config.instance_event_limit, 1);
    }
}
