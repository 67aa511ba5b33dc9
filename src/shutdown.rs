//! Shared shutdown/cancellation state, ported near-verbatim from the
//! teacher's stream shutdown module: an idempotent flag plus a `Notify` so
//! any number of tasks can wait on it without polling.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Shared between the orchestrator and every background task it owns.
#[derive(Default)]
pub struct ShutdownState {
    initiated: AtomicBool,
    notify: Notify,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            initiated: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Signals shutdown. Idempotent: later calls are no-ops.
    pub fn initiate(&self) {
        if !self.initiated.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::initiate`] has been called. Resolves
    /// immediately if it already has.
    pub async fn wait(&self) {
        if self.is_initiated() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_initiated() {
            return;
        }
        notified.await;
    }
}
