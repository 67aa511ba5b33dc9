//! Worker pool (C4).
//!
//! Each worker loops: `take` from the transfer channel, hand the record to
//! the consumer, observe the verdict (spec.md §4.4's table), and report the
//! outcome back to the orchestrator. Generalizes the teacher's consumer-task
//! shape (`crates/span_collector/src/async_bridge.rs`'s `tokio::select!`
//! loop over a channel) from "poll on an interval, batch, export" to "block
//! on one rendezvous item at a time, dispatch to a user callback."

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::admission::AdjustableSemaphore;
use crate::channel::TransferChannel;
use crate::consumer::{ConsumerBoxed, Verdict};
use crate::queue::WorkItem;
use crate::retry::RetryHandle;
use crate::store::SpillStore;

/// Spawns `count` worker tasks draining `channel`. Returns their join
/// handles so the orchestrator can await them during `stop()` (and wrap
/// them for panic supervision — see `Queue::supervise`).
#[allow(clippy::too_many_arguments)]
pub fn spawn<T: Send + 'static>(
    count: usize,
    channel: Arc<TransferChannel<WorkItem<T>>>,
    consumer: Arc<dyn ConsumerBoxed<T>>,
    store: Arc<SpillStore>,
    admission: Arc<AdjustableSemaphore>,
    retry: RetryHandle<T>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let channel = Arc::clone(&channel);
            let consumer = Arc::clone(&consumer);
            let store = Arc::clone(&store);
            let admission = Arc::clone(&admission);
            let retry = retry.clone();

            tokio::spawn(async move {
                loop {
                    let Some(dispatched) = channel.take().await else {
                        // Channel closed: clean termination (spec.md §4.4).
                        break;
                    };
                    let WorkItem { key, envelope } = dispatched.item;
                    let record = envelope.record;
                    let try_count = envelope.try_count;
                    let first_attempt_at = envelope.first_attempt_at;

                    let consumer_for_call = Arc::clone(&consumer);
                    // Isolate a consumer panic to this one item: spawning the
                    // call means a panic unwinds the spawned task, not this
                    // worker, and is reported through `JoinHandle::await` as
                    // a `JoinError` instead of taking the worker down.
                    let call = tokio::spawn(async move {
                        let verdict = consumer_for_call.consume_boxed(&record).await;
                        (record, verdict)
                    });

                    match call.await {
                        Ok((_record, Verdict::Ack)) => {
                            if let Some(k) = key {
                                if let Err(e) = store.remove(k).await {
                                    warn!(worker_id, key = k, error = %e, "failed to ack spill entry");
                                }
                            }
                            admission.release();
                        }
                        Ok((_record, Verdict::FailNoRequeue)) => {
                            if let Some(k) = key {
                                if let Err(e) = store.remove(k).await {
                                    warn!(worker_id, key = k, error = %e, "failed to ack spill entry");
                                }
                            }
                            admission.release();
                        }
                        Ok((record, Verdict::FailRequeue)) => {
                            if let Some(k) = key {
                                if let Err(e) = store.remove(k).await {
                                    warn!(worker_id, key = k, error = %e, "failed to remove spilled entry before requeue");
                                }
                            }
                            // Permit is retained across retries (spec.md §9).
                            retry.schedule(key.unwrap_or(0), record, try_count, first_attempt_at);
                        }
                        Err(join_err) => {
                            // Consumer panicked: treated as FAIL_NOQUEUE and
                            // logged, not escalated to the fatal-error
                            // channel (spec.md §4.4/§7 — this is a
                            // per-item consumer failure, not a background
                            // task failure; the worker loop itself is
                            // still healthy and keeps running). The record
                            // itself was dropped along with the panicked task.
                            error!(worker_id, error = %join_err, "consumer panicked; treating as FAIL_NOQUEUE");
                            if let Some(k) = key {
                                if let Err(e) = store.remove(k).await {
                                    warn!(worker_id, key = k, error = %e, "failed to ack spill entry after panic");
                                }
                            }
                            admission.release();
                        }
                    }
                }
            })
        })
        .collect()
}
