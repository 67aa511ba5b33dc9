//! `filequeue` — an embedded, persistent, single-process FIFO work queue.
//!
//! Producers [`submit`](Queue::submit) items of an application-defined
//! record type; a fixed pool of workers processes them asynchronously by
//! way of a user-supplied [`Consumer`]. Items that cannot be handed off to
//! an idle worker immediately are spilled to an on-disk key-value store
//! (`redb`) so they survive process restarts, and items whose processing
//! returns [`Verdict::FailRequeue`] are re-scheduled with a fixed or
//! exponential backoff. A bounded admission semaphore protects the queue
//! from unbounded growth.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use filequeue::{BincodeCodec, Config, Consumer, Queue, Verdict};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Job {
//!     id: u64,
//! }
//!
//! struct PrintJob;
//!
//! impl Consumer<Job> for PrintJob {
//!     async fn consume(&self, job: &Job) -> Verdict {
//!         println!("processing job {}", job.id);
//!         Verdict::Ack
//!     }
//! }
//!
//! # async fn run() -> filequeue::Result<()> {
//! let config = Config::new("jobs", "./data/jobs");
//! let queue = Arc::new(Queue::new(
//!     config,
//!     Arc::new(BincodeCodec),
//!     Arc::new(PrintJob),
//!     None,
//! )?);
//!
//! queue.start().await?;
//! queue.install_shutdown_hook();
//! queue.submit(Job { id: 1 }).await?;
//! # queue.stop().await?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod channel;
mod codec;
mod config;
mod consumer;
mod error;
mod pool;
mod queue;
mod retry;
mod shutdown;
mod store;

pub use codec::{now_millis, BincodeCodec, Codec, Envelope, EpochMillis};
pub use config::{Config, RetryDelayAlgorithm};
pub use consumer::{Consumer, ConsumerBoxed, Expiration, ExpirationBoxed, Verdict};
pub use error::{Error, FatalError, Result};
pub use queue::Queue;
