//! Queue processor (orchestrator, C6) and the public API (C7 part 2).
//!
//! Owns every other component for the lifetime of the process: the spill
//! store, the transfer channel, the worker pool, the retry scheduler, and
//! the admission semaphore. Generalizes the teacher's `AsyncSpanCollector`
//! (`crates/span_collector/src/async_bridge.rs`) — which owns a consumer
//! task, a shutdown signal, and `register_producer`/`shutdown` — to an
//! orchestrator that additionally owns a durable spill path and a retry
//! scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission::AdjustableSemaphore;
use crate::channel::TransferChannel;
use crate::codec::{now_millis, Codec, Envelope};
use crate::config::Config;
use crate::consumer::{ConsumerBoxed, ExpirationBoxed};
use crate::error::{Error, FatalError, Result};
use crate::pool;
use crate::retry::{self, PendingRetry, RetryHandle};
use crate::shutdown::ShutdownState;
use crate::store::SpillStore;

/// One item in transit through the transfer channel: the application
/// record plus enough metadata to ack or requeue it once a verdict is
/// observed. `key` is `Some` only for entries that came from (or are about
/// to go back to) the spill store; a pure fast-path item never touches disk
/// and so never acquires one (SPEC_FULL §3: "the in-process fast path moves
/// `T` itself with no envelope overhead").
pub(crate) struct WorkItem<T> {
    pub key: Option<u64>,
    pub envelope: Envelope<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Created,
    Started,
    Stopping,
    Stopped,
}

struct Running<T> {
    store: Arc<SpillStore>,
    channel: Arc<TransferChannel<WorkItem<T>>>,
    retry: RetryHandle<T>,
    retry_join: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
    pump_handle: JoinHandle<()>,
    rescan_handle: JoinHandle<()>,
}

/// The embedded, persistent, single-process FIFO work queue.
pub struct Queue<T> {
    config: Config,
    codec: Arc<dyn Codec<T>>,
    consumer: Arc<dyn ConsumerBoxed<T>>,
    expiration: Option<Arc<dyn ExpirationBoxed<T>>>,
    admission: Arc<AdjustableSemaphore>,
    shutdown: Arc<ShutdownState>,
    state: StdMutex<QueueState>,
    running: RwLock<Option<Running<T>>>,
    fatal_tx: watch::Sender<Option<FatalError>>,
    fatal_rx: watch::Receiver<Option<FatalError>>,
    shutdown_hook_installed: AtomicBool,
}

impl<T: Send + Sync + 'static> Queue<T> {
    /// Validates `config` and builds a queue in the `CREATED` state.
    pub fn new(
        config: Config,
        codec: Arc<dyn Codec<T>>,
        consumer: Arc<dyn ConsumerBoxed<T>>,
        expiration: Option<Arc<dyn ExpirationBoxed<T>>>,
    ) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(AdjustableSemaphore::new(config.max_queue_size));
        let (fatal_tx, fatal_rx) = watch::channel(None);

        Ok(Self {
            config,
            codec,
            consumer,
            expiration,
            admission,
            shutdown: Arc::new(ShutdownState::new()),
            state: StdMutex::new(QueueState::Created),
            running: RwLock::new(None),
            fatal_tx,
            fatal_rx,
            shutdown_hook_installed: AtomicBool::new(false),
        })
    }

    fn transition(&self, from: QueueState, to: QueueState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(match *state {
                QueueState::Created => Error::NotStarted,
                QueueState::Started => Error::AlreadyStarted,
                QueueState::Stopping | QueueState::Stopped => Error::Stopped,
            });
        }
        *state = to;
        Ok(())
    }

    fn state(&self) -> QueueState {
        *self.state.lock().unwrap()
    }

    /// `CREATED` → `STARTED` (spec.md §4.6). Opens the spill store, recovers
    /// retry-pending entries, and launches the worker pool, retry
    /// scheduler, and pump. Takes `&Arc<Self>`, matching
    /// `install_shutdown_hook`, because the background tasks it launches
    /// are supervised: each is wrapped to call back into `self.stop()` on
    /// an unexpected exit (spec.md §5/§7).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(QueueState::Created, QueueState::Started)?;

        let store = Arc::new(
            SpillStore::open(self.config.queue_path.as_path(), self.config.queue_name.clone())
                .map_err(|e| {
                    *self.state.lock().unwrap() = QueueState::Created;
                    e
                })?,
        );

        let spill_count = store.size().await?;
        let to_acquire = spill_count.min(self.config.max_queue_size as u64);
        for _ in 0..to_acquire {
            // Never fails: `to_acquire <= max_queue_size`, the semaphore's
            // starting capacity (spec.md §4.6 step 2).
            let _ = self.admission.try_acquire();
        }

        let channel = Arc::new(TransferChannel::new(self.config.worker_count));

        let channel_for_requeue = Arc::clone(&channel);
        let requeue: retry::RequeueFn<T> = Arc::new(move |pending: PendingRetry<T>| {
            let channel = Arc::clone(&channel_for_requeue);
            Box::pin(async move {
                let item = WorkItem {
                    key: None,
                    envelope: Envelope {
                        record: pending.record,
                        try_count: pending.try_count,
                        first_attempt_at: Some(pending.first_attempt_at),
                    },
                };
                // Bypasses the admission semaphore: the permit was retained
                // across retries and was never released (spec.md §9).
                if channel.offer(0, item).await.is_err() {
                    warn!("failed to requeue retried record: channel closed");
                }
            })
        });

        let (retry_handle, retry_join) = retry::spawn(
            Arc::new(self.config.clone()),
            self.expiration.clone(),
            requeue,
            Arc::clone(&self.shutdown),
        );

        self.recover_retries(&store, &retry_handle).await?;

        let worker_handles = pool::spawn(
            self.config.worker_count,
            Arc::clone(&channel),
            Arc::clone(&self.consumer),
            Arc::clone(&store),
            Arc::clone(&self.admission),
            retry_handle.clone(),
        )
        .into_iter()
        .map(|handle| self.supervise("worker", handle))
        .collect();

        let pump_handle = Self::spawn_pump(
            Arc::clone(&store),
            Arc::clone(&channel),
            Arc::clone(&self.codec),
            Arc::clone(&self.shutdown),
        );
        let pump_handle = self.supervise("pump", pump_handle);

        let rescan_handle = Self::spawn_rescan(
            Arc::clone(&store),
            Arc::clone(&self.codec),
            retry_handle.clone(),
            self.config.persist_retry_delay,
            Arc::clone(&self.shutdown),
        );
        let rescan_handle = self.supervise("persistent_retry_rescan", rescan_handle);

        let retry_join = self.supervise("retry_timekeeper", retry_join);

        *self.running.write().await = Some(Running {
            store,
            channel,
            retry: retry_handle,
            retry_join,
            worker_handles,
            pump_handle,
            rescan_handle,
        });

        info!(
            queue = %self.config.queue_name,
            workers = self.config.worker_count,
            recovered = spill_count,
            "queue started"
        );
        Ok(())
    }

    /// Scans the spill store once for entries with a persisted `try_count >
    /// 0`, handing each to the retry scheduler via `restore` and removing it
    /// from disk (SPEC_FULL §4.5). Used both at `start()` and by the
    /// periodic persistent-retry rescan; idempotent because a restored entry
    /// is removed and so cannot be seen again.
    async fn recover_retries(&self, store: &SpillStore, retry: &RetryHandle<T>) -> Result<()> {
        for (key, bytes) in store.iter().await? {
            let envelope = match self.codec.decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(key, error = %e, "failed to decode spilled entry during recovery; leaving in place");
                    continue;
                }
            };
            if envelope.try_count > 0 {
                let first_attempt_at = envelope.first_attempt_at.unwrap_or_else(now_millis);
                retry.restore(key, envelope.record, envelope.try_count, first_attempt_at);
                store.remove(key).await?;
            }
        }
        Ok(())
    }

    fn spawn_pump(
        store: Arc<SpillStore>,
        channel: Arc<TransferChannel<WorkItem<T>>>,
        codec: Arc<dyn Codec<T>>,
        shutdown: Arc<ShutdownState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut cursor: Option<u64> = None;
            loop {
                if shutdown.is_initiated() {
                    break;
                }
                match store.peek_after(cursor).await {
                    Ok(Some((key, bytes))) => match codec.decode(&bytes) {
                        Ok(envelope) => {
                            if envelope.try_count > 0 {
                                // Already claimed by the retry scheduler in
                                // the interval between this peek and the
                                // rescan task's removal; skip past it.
                                cursor = Some(key);
                                continue;
                            }
                            let item = WorkItem { key: Some(key), envelope };
                            tokio::select! {
                                biased;
                                () = shutdown.wait() => break,
                                res = channel.offer(0, item) => {
                                    match res {
                                        Ok(()) => cursor = Some(key),
                                        Err(_) => break,
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(key, error = %e, "failed to decode spilled entry; skipping");
                            cursor = Some(key);
                        }
                    },
                    Ok(None) => {
                        tokio::select! {
                            biased;
                            () = shutdown.wait() => break,
                            () = tokio::time::sleep(Duration::from_millis(20)) => {}
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "spill store peek failed; backing off");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    fn spawn_rescan(
        store: Arc<SpillStore>,
        codec: Arc<dyn Codec<T>>,
        retry: RetryHandle<T>,
        interval: Duration,
        shutdown: Arc<ShutdownState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.wait() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let entries = match store.iter().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(error = %e, "persistent-retry rescan failed to read spill store");
                        continue;
                    }
                };
                for (key, bytes) in entries {
                    let envelope = match codec.decode(&bytes) {
                        Ok(envelope) => envelope,
                        Err(_) => continue,
                    };
                    if envelope.try_count > 0 {
                        let first_attempt_at = envelope.first_attempt_at.unwrap_or_else(now_millis);
                        retry.restore(key, envelope.record, envelope.try_count, first_attempt_at);
                        if let Err(e) = store.remove(key).await {
                            warn!(key, error = %e, "failed to remove entry recovered by persistent-retry rescan");
                        }
                    }
                }
            }
        })
    }

    /// Non-blocking submit: fails with [`Error::QueueFull`] if no permit is
    /// immediately available.
    pub async fn submit(&self, record: T) -> Result<()> {
        self.submit_inner(record, None).await
    }

    /// Submit that blocks on permit acquisition up to `timeout`.
    pub async fn submit_timeout(&self, record: T, timeout: Duration) -> Result<()> {
        self.submit_inner(record, Some(timeout)).await
    }

    async fn submit_inner(&self, record: T, timeout: Option<Duration>) -> Result<()> {
        match self.state() {
            QueueState::Created => return Err(Error::NotStarted),
            QueueState::Stopping | QueueState::Stopped => return Err(Error::Stopped),
            QueueState::Started => {}
        }

        match timeout {
            Some(t) => {
                tokio::select! {
                    biased;
                    () = self.shutdown.wait() => return Err(Error::Stopped),
                    res = self.admission.acquire_timeout(t) => res?,
                }
            }
            None => self.admission.try_acquire()?,
        }

        if let Err(e) = self.place(record).await {
            self.admission.release();
            return Err(e);
        }
        Ok(())
    }

    /// Places an admitted record: fast path if the spill store is currently
    /// empty and a worker is immediately available, else append to the
    /// spill store (spec.md §4.6's submit path).
    async fn place(&self, record: T) -> Result<()> {
        let running = self.running.read().await;
        let Some(running) = running.as_ref() else {
            return Err(Error::NotStarted);
        };

        let envelope = Envelope::fresh(record);
        let spill_is_empty = running.store.size().await? == 0;

        if spill_is_empty {
            let item = WorkItem { key: None, envelope };
            match running.channel.try_offer(0, item) {
                Ok(()) => return Ok(()),
                Err(item) => {
                    let bytes = self.codec.encode(&item.envelope)?;
                    running.store.append(bytes).await?;
                    return Ok(());
                }
            }
        }

        let bytes = self.codec.encode(&envelope)?;
        running.store.append(bytes).await?;
        Ok(())
    }

    /// Current number of admitted-but-unacknowledged items.
    pub fn size(&self) -> usize {
        self.admission.max().saturating_sub(self.admission.available())
    }

    pub fn available_permits(&self) -> usize {
        self.admission.available()
    }

    /// Observes background-task failures without polling logs (SPEC_FULL §7).
    pub fn fatal_errors(&self) -> watch::Receiver<Option<FatalError>> {
        self.fatal_rx.clone()
    }

    /// `STARTED` → `STOPPING` → `STOPPED` (spec.md §4.6). Idempotent from
    /// `STOPPING`/`STOPPED`.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                QueueState::Stopping | QueueState::Stopped => return Ok(()),
                QueueState::Created => return Err(Error::NotStarted),
                QueueState::Started => *state = QueueState::Stopping,
            }
        }

        self.shutdown.initiate();

        let running = self.running.write().await.take();
        let Some(running) = running else {
            *self.state.lock().unwrap() = QueueState::Stopped;
            return Ok(());
        };

        running.channel.close();
        for handle in running.worker_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed to join cleanly");
            }
        }

        let pending = running.retry.drain().await;
        if let Err(e) = running.retry_join.await {
            error!(error = %e, "retry timekeeper failed to join cleanly");
        }

        for pending in pending {
            let envelope = Envelope {
                record: pending.record,
                try_count: pending.try_count,
                first_attempt_at: Some(pending.first_attempt_at),
            };
            match self.codec.encode(&envelope) {
                Ok(bytes) => {
                    if let Err(e) = running.store.append(bytes).await {
                        error!(error = %e, "failed to persist pending retry during shutdown");
                    }
                }
                Err(e) => error!(error = %e, "failed to encode pending retry during shutdown"),
            }
        }

        if let Err(e) = running.pump_handle.await {
            error!(error = %e, "pump task failed to join cleanly");
        }
        if let Err(e) = running.rescan_handle.await {
            error!(error = %e, "persistent-retry rescan task failed to join cleanly");
        }

        running.store.close();

        *self.state.lock().unwrap() = QueueState::Stopped;
        info!(queue = %self.config.queue_name, "queue stopped");
        Ok(())
    }
}

impl<T: Send + Sync + 'static> Queue<T> {
    /// Wraps a background task's `JoinHandle` so an unexpected exit escalates
    /// to a full `stop()` and is surfaced on the fatal-error channel
    /// (spec.md §5: "panic in any component triggers `stop()`"; §7:
    /// "Background-thread panics ... are surfaced via a fatal-error
    /// channel"). A clean exit that happens after `stop()` has already
    /// initiated shutdown is the expected path and is not escalated — every
    /// background loop this wraps (pump, rescan, retry timekeeper, worker)
    /// only returns once `shutdown.initiate()` has already run or the
    /// channel it reads has been closed, which `stop()` only does after
    /// calling `shutdown.initiate()` itself, so the ordering is race-free.
    ///
    /// The returned handle is what `Running` stores and `stop()` awaits;
    /// escalation spawns a *separate* detached task to call `self.stop()`
    /// rather than calling it inline, so this wrapper's own `JoinHandle`
    /// resolves immediately and `stop()` can safely await it without
    /// joining a task on itself.
    fn supervise(self: &Arc<Self>, task: &'static str, inner: JoinHandle<()>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = inner.await;
            if this.shutdown.is_initiated() {
                return;
            }
            let message = match outcome {
                Ok(()) => "exited unexpectedly before shutdown was requested".to_string(),
                Err(join_err) => join_err.to_string(),
            };
            error!(task, %message, "background task failed; stopping queue");
            let _ = this.fatal_tx.send(Some(FatalError { task, message }));
            let stopper = Arc::clone(&this);
            tokio::spawn(async move {
                let _ = stopper.stop().await;
            });
        })
    }

    /// Installs a single idempotent process shutdown hook awaiting
    /// `ctrl_c()` that calls `stop()` once (SPEC_FULL §4.7). A second call
    /// from any source is a no-op because `stop()` itself is idempotent.
    pub fn install_shutdown_hook(self: &Arc<Self>) {
        if self.shutdown_hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = this.stop().await;
            }
        });
    }
}
