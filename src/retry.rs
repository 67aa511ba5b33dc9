//! Retry scheduler (C5).
//!
//! A min-heap keyed on `nextAttemptAt`, served by a single timekeeper task,
//! generalizing the teacher's `RetryingExporter::delay_for_attempt`
//! (`crates/span_collector/src/resilient_exporter.rs`) from "retry one
//! export call in a loop" to "re-enter a heap and wake a timekeeper."
//!
//! Other tasks never touch the heap directly: they post
//! [`RetryHandle::schedule`]/[`RetryHandle::restore`] requests over an
//! unbounded channel, matching spec.md §5's "the retry heap is owned by the
//! timekeeper; other threads post to it via a thread-safe queue."

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{now_millis, EpochMillis};
use crate::config::{Config, RetryDelayAlgorithm};
use crate::consumer::ExpirationBoxed;
use crate::shutdown::ShutdownState;

/// A record waiting for its next attempt, with the metadata needed to
/// compute the following delay and to round-trip through persistence.
#[derive(Debug)]
pub struct PendingRetry<T> {
    pub record: T,
    pub try_count: u32,
    pub first_attempt_at: EpochMillis,
}

/// Callback invoked when a retry's `nextAttemptAt` elapses: re-enters the
/// record into the orchestrator's transfer channel, bypassing the admission
/// semaphore (spec.md §9: the permit was never released for `FAIL_REQUEUE`).
pub type RequeueFn<T> =
    Arc<dyn Fn(PendingRetry<T>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct ScheduledRetry<T> {
    next_attempt_at: EpochMillis,
    original_key: u64,
    pending: PendingRetry<T>,
}

impl<T> PartialEq for ScheduledRetry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.next_attempt_at == other.next_attempt_at && self.original_key == other.original_key
    }
}
impl<T> Eq for ScheduledRetry<T> {}
impl<T> PartialOrd for ScheduledRetry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for ScheduledRetry<T> {
    // `BinaryHeap` is a max-heap; reverse so the earliest deadline (and, on a
    // tie, the smallest original key, per spec.md §3) pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .next_attempt_at
            .cmp(&self.next_attempt_at)
            .then_with(|| other.original_key.cmp(&self.original_key))
    }
}

enum Command<T> {
    Schedule {
        original_key: u64,
        record: T,
        try_count: u32,
        first_attempt_at: Option<EpochMillis>,
    },
    Restore {
        original_key: u64,
        record: T,
        try_count: u32,
        first_attempt_at: Option<EpochMillis>,
    },
    Drain(oneshot::Sender<Vec<PendingRetry<T>>>),
}

/// Handle used by producers and the worker pool to post into the scheduler.
/// Cheaply cloneable; the heap itself lives only inside the timekeeper task.
#[derive(Clone)]
pub struct RetryHandle<T> {
    cmd_tx: mpsc::UnboundedSender<Command<T>>,
    len: Arc<AtomicUsize>,
}

impl<T: Send + 'static> RetryHandle<T> {
    /// Hands a freshly failed record (`FAIL_REQUEUE`) to the scheduler.
    /// `try_count`/`first_attempt_at` are the values observed *before* this
    /// attempt; the scheduler increments `try_count` itself.
    pub fn schedule(&self, original_key: u64, record: T, try_count: u32, first_attempt_at: Option<EpochMillis>) {
        let _ = self.cmd_tx.send(Command::Schedule {
            original_key,
            record,
            try_count,
            first_attempt_at,
        });
    }

    /// Re-admits a record recovered from the spill store at startup with a
    /// persisted `try_count > 0` (SPEC_FULL §4.5). Unlike `schedule`, this
    /// does not increment `try_count` or re-check `max_tries` — that check
    /// already happened, before the record was persisted, on the prior run.
    pub fn restore(&self, original_key: u64, record: T, try_count: u32, first_attempt_at: EpochMillis) {
        let _ = self.cmd_tx.send(Command::Restore {
            original_key,
            record,
            try_count,
            first_attempt_at: Some(first_attempt_at),
        });
    }

    /// Approximate count of records currently held in the heap.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every pending retry out of the heap, for `stop()` to persist
    /// back to the spill store with `try_count` preserved (spec.md §4.6).
    pub async fn drain(&self) -> Vec<PendingRetry<T>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Drain(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

fn delay_for(config: &Config, try_count_at_receipt: u32) -> Duration {
    match config.retry_delay_algorithm {
        RetryDelayAlgorithm::Fixed => config.retry_delay,
        RetryDelayAlgorithm::Exponential => {
            let factor = 2u64.saturating_pow(try_count_at_receipt);
            let millis = (config.retry_delay.as_millis() as u64).saturating_mul(factor);
            Duration::from_millis(millis.min(config.max_retry_delay.as_millis() as u64))
        }
    }
}

/// Spawns the timekeeper task and returns a handle plus its `JoinHandle`.
pub fn spawn<T: Send + 'static>(
    config: Arc<Config>,
    expiration: Option<Arc<dyn ExpirationBoxed<T>>>,
    requeue: RequeueFn<T>,
    shutdown: Arc<ShutdownState>,
) -> (RetryHandle<T>, JoinHandle<()>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command<T>>();
    let len = Arc::new(AtomicUsize::new(0));
    let handle = RetryHandle {
        cmd_tx,
        len: Arc::clone(&len),
    };

    let join = tokio::spawn(async move {
        let mut heap: BinaryHeap<ScheduledRetry<T>> = BinaryHeap::new();

        loop {
            let sleep_for = heap
                .peek()
                .map(|s| {
                    let now = now_millis();
                    if s.next_attempt_at <= now {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(s.next_attempt_at - now)
                    }
                })
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                biased;

                () = shutdown.wait() => {
                    debug!("retry timekeeper observed shutdown");
                    break;
                }

                () = tokio::time::sleep(sleep_for), if !heap.is_empty() => {
                    if let Some(top) = heap.peek() {
                        if top.next_attempt_at <= now_millis() {
                            let fired = heap.pop().expect("heap peeked non-empty above");
                            len.fetch_sub(1, Ordering::Relaxed);
                            let cb = Arc::clone(&requeue);
                            tokio::spawn(cb(fired.pending));
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Schedule { original_key, record, try_count, first_attempt_at }) => {
                            if config.max_tries > 0 && try_count + 1 >= config.max_tries {
                                warn!(original_key, try_count, "max_tries reached; expiring record");
                                if let Some(exp) = expiration.clone() {
                                    tokio::spawn(async move {
                                        exp.expire_boxed(&record).await;
                                    });
                                }
                                continue;
                            }
                            let delay = delay_for(&config, try_count);
                            let first_attempt_at = first_attempt_at.unwrap_or_else(now_millis);
                            heap.push(ScheduledRetry {
                                next_attempt_at: now_millis() + delay.as_millis() as u64,
                                original_key,
                                pending: PendingRetry {
                                    record,
                                    try_count: try_count + 1,
                                    first_attempt_at,
                                },
                            });
                            len.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Command::Restore { original_key, record, try_count, first_attempt_at }) => {
                            heap.push(ScheduledRetry {
                                next_attempt_at: now_millis(),
                                original_key,
                                pending: PendingRetry {
                                    record,
                                    try_count,
                                    first_attempt_at: first_attempt_at.unwrap_or_else(now_millis),
                                },
                            });
                            len.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Command::Drain(reply)) => {
                            let drained: Vec<PendingRetry<T>> =
                                heap.drain().map(|s| s.pending).collect();
                            len.store(0, Ordering::Relaxed);
                            let _ = reply.send(drained);
                        }
                        None => {
                            debug!("retry command channel closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    (handle, join)
}
