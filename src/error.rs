//! Error surface for the queue (§7).

use thiserror::Error;

/// Errors returned by public queue operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The queue has not been started yet.
    #[error("queue has not been started")]
    NotStarted,

    /// `start()` was called on a queue that is already started.
    #[error("queue is already started")]
    AlreadyStarted,

    /// The queue has been stopped; no further submits are accepted.
    #[error("queue has been stopped")]
    Stopped,

    /// A configuration or argument violates a documented constraint.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The admission semaphore refused a permit within the requested timeout.
    #[error("queue is full")]
    QueueFull,

    /// The spill store signaled it is out of disk space.
    #[error("no space left on device")]
    NoSpace,

    /// Any other storage or codec I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// A blocking call was cancelled by `stop()`.
    #[error("interrupted by shutdown")]
    Interrupted,
}

impl Error {
    /// Returns `true` if this is a recoverable, caller-retryable condition.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }

    /// Returns `true` if the queue is permanently unusable from here on.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A background-task failure surfaced to the embedding application (§7).
#[derive(Debug, Clone, Error)]
#[error("background task '{task}' panicked: {message}")]
pub struct FatalError {
    /// Name of the failing component (`"pump"`, `"worker"`, `"timekeeper"`, ...).
    pub task: &'static str,
    /// Panic payload, downcast to a string where possible.
    pub message: String,
}
