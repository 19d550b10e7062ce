//! Capture configuration
//!
//! Every knob of the recording pipeline with its default. The CLI maps its
//! flags onto [`CaptureConfig`]; library users build one directly.

use std::time::Duration;

use crate::domain::{CaptureError, Pid};

/// Default ring buffer size (1 MiB)
pub const DEFAULT_RING_SIZE: usize = 1024 * 1024;

/// Default capacity of the reader → processor queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default wait on the ring buffer before re-checking for cancellation
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default time the reader keeps draining after a stop request
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Ring buffer size in bytes, must be a power of two
    pub ring_size: usize,
    /// Bounded queue between reader and processor
    pub queue_capacity: usize,
    pub poll_timeout: Duration,
    pub drain_timeout: Duration,
    /// Only capture this process (`Pid::ALL` = every process)
    pub target_pid: Pid,
    /// Also install a return probe per function
    pub exit_probes: bool,
    /// Restrict capture to the breakpoint ids installed for this recording
    pub use_allow_list: bool,
    /// Refuse session artifacts with unknown top-level fields
    pub strict_load: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ring_size: DEFAULT_RING_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            target_pid: Pid::ALL,
            exit_probes: false,
            use_allow_list: false,
            strict_load: false,
        }
    }
}

impl CaptureConfig {
    /// Check invariants the pipeline relies on
    ///
    /// # Errors
    /// Returns `CaptureError::InvalidConfig` naming the offending field
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !self.ring_size.is_power_of_two() {
            return Err(CaptureError::InvalidConfig(format!(
                "ring size {} is not a power of two",
                self.ring_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(CaptureError::InvalidConfig("queue capacity must be at least 1".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(CaptureError::InvalidConfig("poll timeout must be non-zero".into()));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn ring_size_u32(&self) -> u32 {
        self.ring_size.min(u32::MAX as usize) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_size, 1024 * 1024);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.drain_timeout, Duration::from_millis(500));
        assert!(config.target_pid.is_all());
    }

    #[test]
    fn test_rejects_non_power_of_two_ring() {
        let config = CaptureConfig { ring_size: 3000, ..CaptureConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_rejects_zero_queue() {
        let config = CaptureConfig { queue_capacity: 0, ..CaptureConfig::default() };
        assert!(config.validate().is_err());
    }
}
