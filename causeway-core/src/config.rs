//! Repository configuration
//!
//! Loaded from environment variables with defaults suitable for tests and
//! single-process deployments.

use crate::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What `publish` does when every pipeline slot is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Wait for a slot (optionally bounded by `submit_timeout`).
    #[default]
    Block,
    /// Fail immediately with `RepositoryError::PipelineFull`.
    Reject,
}

impl BackpressurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressurePolicy::Block => "block",
            BackpressurePolicy::Reject => "reject",
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackpressurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "reject" => Ok(BackpressurePolicy::Reject),
            other => Err(ConfigError::InvalidValue {
                field: "backpressure".to_string(),
                value: other.to_string(),
                reason: "expected 'block' or 'reject'".to_string(),
            }),
        }
    }
}

/// Pipeline and repository settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Number of reusable command slots. Must be a power of two.
    pub ring_capacity: usize,

    /// Worker threads in the journaling stage.
    pub journal_workers: usize,

    /// Worker threads in the completion stage.
    pub completion_workers: usize,

    pub backpressure: BackpressurePolicy,

    /// Upper bound on waiting for a slot under `Block`.
    pub submit_timeout: Option<Duration>,

    /// Upper bound on waiting for a named lock (default lock provider only).
    pub lock_timeout: Option<Duration>,

    /// Node id stamped into every timestamp this repository issues.
    pub node_id: u16,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            journal_workers: 4,
            completion_workers: 2,
            backpressure: BackpressurePolicy::Block,
            submit_timeout: None,
            lock_timeout: None,
            node_id: 0,
        }
    }
}

impl RepositoryConfig {
    /// Create RepositoryConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CAUSEWAY_RING_CAPACITY`: Slot count, power of two (default: 1024)
    /// - `CAUSEWAY_JOURNAL_WORKERS`: Journaling threads (default: 4)
    /// - `CAUSEWAY_COMPLETION_WORKERS`: Completion threads (default: 2)
    /// - `CAUSEWAY_BACKPRESSURE`: "block" or "reject" (default: block)
    /// - `CAUSEWAY_SUBMIT_TIMEOUT_MS`: Slot wait bound under block (default: unbounded)
    /// - `CAUSEWAY_LOCK_TIMEOUT_MS`: Named lock wait bound (default: unbounded)
    /// - `CAUSEWAY_NODE_ID`: Timestamp node id (default: 0)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ring_capacity = std::env::var("CAUSEWAY_RING_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.ring_capacity);

        let journal_workers = std::env::var("CAUSEWAY_JOURNAL_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.journal_workers);

        let completion_workers = std::env::var("CAUSEWAY_COMPLETION_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.completion_workers);

        let backpressure = std::env::var("CAUSEWAY_BACKPRESSURE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.backpressure);

        let submit_timeout = std::env::var("CAUSEWAY_SUBMIT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis);

        let lock_timeout = std::env::var("CAUSEWAY_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis);

        let node_id = std::env::var("CAUSEWAY_NODE_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.node_id);

        Self {
            ring_capacity,
            journal_workers,
            completion_workers,
            backpressure,
            submit_timeout,
            lock_timeout,
            node_id,
        }
    }

    pub fn with_ring_capacity(mut self, ring_capacity: usize) -> Self {
        self.ring_capacity = ring_capacity;
        self
    }

    pub fn with_workers(mut self, journal_workers: usize, completion_workers: usize) -> Self {
        self.journal_workers = journal_workers;
        self.completion_workers = completion_workers;
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressurePolicy) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = Some(timeout);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_node_id(mut self, node_id: u16) -> Self {
        self.node_id = node_id;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "ring_capacity".to_string(),
                value: self.ring_capacity.to_string(),
                reason: "must be a non-zero power of two".to_string(),
            });
        }
        if self.journal_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "journal_workers".to_string(),
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.completion_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "completion_workers".to_string(),
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.backpressure == BackpressurePolicy::Reject && self.submit_timeout.is_some() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "backpressure=reject".to_string(),
                option_b: "submit_timeout".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RepositoryConfig::default();
        assert_eq!(config.ring_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_capacity() {
        let config = RepositoryConfig::default().with_ring_capacity(1000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "ring_capacity"
        ));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let config = RepositoryConfig::default().with_workers(0, 1);
        assert!(config.validate().is_err());
        let config = RepositoryConfig::default().with_workers(1, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_policy_conflicts_with_timeout() {
        let config = RepositoryConfig::default()
            .with_backpressure(BackpressurePolicy::Reject)
            .with_submit_timeout(Duration::from_millis(10));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_backpressure_parses_case_insensitively() {
        assert_eq!("Reject".parse::<BackpressurePolicy>().unwrap(), BackpressurePolicy::Reject);
        assert_eq!(" block ".parse::<BackpressurePolicy>().unwrap(), BackpressurePolicy::Block);
        assert!("drop".parse::<BackpressurePolicy>().is_err());
    }
}
