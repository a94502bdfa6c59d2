//! Refresh orchestrator configuration.
//!
//! All tunables of a refresh run live here: lock timeouts, the two retry
//! budgets, partition DDL batching, and the snapshot verification loop.

use std::time::Duration;

/// Configuration for the refresh orchestrator.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Timeout for every catalog lock acquisition.
    pub lock_timeout: Duration,
    /// Maximum attempts of the snapshot-and-verify cycle before the run
    /// fails with an unstable-partition-layout error.
    pub max_snapshot_verify_attempts: u32,
    /// Sleep between snapshot verification attempts.
    pub snapshot_retry_delay: Duration,
    /// Maximum refresh attempts that failed on a lock timeout.
    pub max_lock_retry_times: u32,
    /// Minimum refresh attempts for general failures; a run context may
    /// request more, never fewer.
    pub max_refresh_failure_retry_times: u32,
    /// Sleep between refresh retry attempts.
    pub retry_delay: Duration,
    /// Number of partitions created per add-partition DDL request.
    pub create_partition_batch_size: usize,
    /// Sleep between add-partition DDL batches.
    pub partition_batch_interval: Duration,
    /// Maximum length of a persisted error message, in bytes.
    pub max_error_message_len: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(30_000),
            max_snapshot_verify_attempts: 10,
            snapshot_retry_delay: Duration::from_millis(100),
            max_lock_retry_times: 3,
            max_refresh_failure_retry_times: 1,
            retry_delay: Duration::from_millis(1000),
            create_partition_batch_size: 64,
            partition_batch_interval: Duration::from_millis(100),
            max_error_message_len: 65_535,
        }
    }
}

impl RefreshConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the catalog lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the maximum snapshot-and-verify attempts.
    ///
    /// # Panics
    /// Panics if `attempts` is 0.
    pub fn with_max_snapshot_verify_attempts(mut self, attempts: u32) -> Self {
        assert!(attempts > 0, "snapshot verify attempts must be at least 1");
        self.max_snapshot_verify_attempts = attempts;
        self
    }

    /// Set the sleep between snapshot verification attempts.
    pub fn with_snapshot_retry_delay(mut self, delay: Duration) -> Self {
        self.snapshot_retry_delay = delay;
        self
    }

    /// Set the lock-timeout retry budget.
    pub fn with_max_lock_retry_times(mut self, times: u32) -> Self {
        self.max_lock_retry_times = times;
        self
    }

    /// Set the general-failure retry budget floor.
    pub fn with_max_refresh_failure_retry_times(mut self, times: u32) -> Self {
        self.max_refresh_failure_retry_times = times;
        self
    }

    /// Set the sleep between refresh retry attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the add-partition DDL batch size.
    ///
    /// # Panics
    /// Panics if `size` is 0.
    pub fn with_create_partition_batch_size(mut self, size: usize) -> Self {
        assert!(size > 0, "partition batch size must be at least 1");
        self.create_partition_batch_size = size;
        self
    }

    /// Set the sleep between add-partition DDL batches.
    pub fn with_partition_batch_interval(mut self, interval: Duration) -> Self {
        self.partition_batch_interval = interval;
        self
    }

    /// Set the maximum persisted error message length.
    pub fn with_max_error_message_len(mut self, len: usize) -> Self {
        self.max_error_message_len = len;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RefreshConfig::default();
        assert_eq!(config.create_partition_batch_size, 64);
        assert_eq!(config.max_snapshot_verify_attempts, 10);
        assert_eq!(config.max_error_message_len, 65_535);
    }

    #[test]
    fn test_builder() {
        let config = RefreshConfig::new()
            .with_lock_timeout(Duration::from_millis(50))
            .with_max_lock_retry_times(5)
            .with_create_partition_batch_size(8);
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
        assert_eq!(config.max_lock_retry_times, 5);
        assert_eq!(config.create_partition_batch_size, 8);
    }

    #[test]
    #[should_panic(expected = "batch size")]
    fn test_zero_batch_size_rejected() {
        RefreshConfig::new().with_create_partition_batch_size(0);
    }
}
