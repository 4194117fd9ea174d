//! Configuration types for the worker pool.

use std::time::Duration;

use crate::error::{Result, TqError};

/// Check that a namespace is usable as a table or key prefix.
///
/// Allowed: 1 to 48 ASCII letters, digits or underscores, not starting with
/// a digit.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace.len() <= 48
        && !namespace.starts_with(|c: char| c.is_ascii_digit())
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TqError::Config(format!("Invalid namespace: '{}'", namespace)))
    }
}

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity stamped into `claimed_by` and `locked_by`. Generated when unset.
    pub worker_id: Option<String>,
    /// First idle poll delay.
    pub poll_interval: Duration,
    /// Cap for the idle poll backoff.
    pub max_poll_interval: Duration,
    /// Random jitter added to every idle poll.
    pub poll_jitter: Duration,
    /// Interval for the scheduler tick.
    pub scheduler_interval: Duration,
    /// Run the scheduler loop in this pool.
    pub enable_scheduler: bool,
    /// Run the stale-job reaper in this pool.
    pub enable_reaper: bool,
    /// Interval for the reaper loop.
    pub reaper_interval: Duration,
    /// `RUNNING` jobs started longer ago than this are reclaimed by the reaper.
    pub stale_threshold: Duration,
    /// Trigger rows older than this are purged by the reaper.
    pub trigger_retention: Duration,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(2),
            poll_jitter: Duration::from_millis(25),
            scheduler_interval: Duration::from_secs(1),
            enable_scheduler: true,
            enable_reaper: false,
            reaper_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(30 * 60),
            trigger_retention: Duration::from_secs(7 * 24 * 60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fixed worker id.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = Some(worker_id.into());
        self
    }

    /// Set the idle poll bounds.
    pub fn poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.config.poll_interval = min;
        self.config.max_poll_interval = max;
        self
    }

    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.config.poll_jitter = jitter;
        self
    }

    /// Set the scheduler interval.
    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler_interval = interval;
        self
    }

    pub fn enable_scheduler(mut self, enabled: bool) -> Self {
        self.config.enable_scheduler = enabled;
        self
    }

    /// Enable the reaper with the given stale threshold.
    pub fn enable_reaper(mut self, stale_threshold: Duration) -> Self {
        self.config.enable_reaper = true;
        self.config.stale_threshold = stale_threshold;
        self
    }

    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    pub fn trigger_retention(mut self, retention: Duration) -> Self {
        self.config.trigger_retention = retention;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("shop").is_ok());
        assert!(validate_namespace("shop_eu_2").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("2shop").is_err());
        assert!(validate_namespace("shop; DROP TABLE x").is_err());
        assert!(validate_namespace("shop-eu").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.is_none());
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_poll_interval, Duration::from_secs(2));
        assert!(config.enable_scheduler);
        assert!(!config.enable_reaper);
        assert_eq!(config.trigger_retention, Duration::from_secs(604_800));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builder() {
        let config = WorkerConfig::builder()
            .worker_id("api-1")
            .poll_interval(Duration::from_millis(10), Duration::from_millis(100))
            .enable_reaper(Duration::from_secs(600))
            .enable_scheduler(false)
            .shutdown_timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.worker_id.as_deref(), Some("api-1"));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.max_poll_interval, Duration::from_millis(100));
        assert!(config.enable_reaper);
        assert_eq!(config.stale_threshold, Duration::from_secs(600));
        assert!(!config.enable_scheduler);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
