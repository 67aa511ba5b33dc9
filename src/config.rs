//! External configuration (§6).

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Delay policy honored by the retry scheduler (C5) between `FAIL_REQUEUE`
/// and the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelayAlgorithm {
    /// Always wait `retry_delay`.
    Fixed,
    /// Wait `min(max_retry_delay, retry_delay * 2^tryCount)`.
    Exponential,
}

/// Queue configuration.
///
/// Unlike the teacher's `Config::new`, which `assert!`s on bad input at
/// construction, this is validated at [`crate::queue::Queue::start`] time
/// and returns [`Error::InvalidArg`]: the values here are operational data
/// supplied by the embedding application at runtime, not tuning constants
/// fixed at the call site.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical name; used as the map name inside the spill store.
    pub queue_name: String,
    /// Directory for the spill store's files. Must be writable.
    pub queue_path: PathBuf,
    /// Admission ceiling. Defaults to an effectively unbounded value.
    pub max_queue_size: usize,
    /// `0` means infinite retries; otherwise the cap on attempts.
    pub max_tries: u32,
    /// Base delay between retry attempts.
    pub retry_delay: Duration,
    /// Cap on the delay under `Exponential` backoff.
    pub max_retry_delay: Duration,
    /// Backoff policy.
    pub retry_delay_algorithm: RetryDelayAlgorithm,
    /// Interval at which the persistent-retry scanner rescans the spill store.
    pub persist_retry_delay: Duration,
    /// Size of the worker pool. Defaults to the number of hardware threads.
    pub worker_count: usize,
}

impl Config {
    /// Starts from [`Config::default`] with `queue_name`/`queue_path` set.
    pub fn new(queue_name: impl Into<String>, queue_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue_path: queue_path.into(),
            ..Self::default()
        }
    }

    /// Checks the documented constraints, returning `Error::InvalidArg` on
    /// the first violation rather than panicking.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::InvalidArg("queue_name must not be empty".into()));
        }
        if self.max_queue_size == 0 {
            return Err(Error::InvalidArg("max_queue_size must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(Error::InvalidArg("worker_count must be at least 1".into()));
        }
        if self.retry_delay_algorithm == RetryDelayAlgorithm::Exponential
            && self.max_retry_delay < self.retry_delay
        {
            return Err(Error::InvalidArg(
                "max_retry_delay must be >= retry_delay under Exponential backoff".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_name: "queue".to_string(),
            queue_path: PathBuf::from("."),
            // INT_MAX-equivalent "unbounded" default (spec.md §6).
            max_queue_size: i32::MAX as usize,
            max_tries: 0,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_delay_algorithm: RetryDelayAlgorithm::Fixed,
            persist_retry_delay: Duration::from_secs(30),
            worker_count: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
        }
    }
}
