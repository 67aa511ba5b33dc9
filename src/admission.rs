//! Admission semaphore (C7, part 1).
//!
//! Bounds the number of items the queue will hold in memory plus on disk at
//! once. Built on `tokio::sync::Semaphore`, as the teacher's async bridge
//! uses to bound concurrent exports, extended with a resizable max so
//! `setMax` (SPEC_FULL §4.7) can grow or shrink the bound at runtime without
//! replacing the semaphore.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// A permit held across an item's lifetime, including any number of
/// `FAIL_REQUEUE` retries. Released exactly once, by the queue, on `Ack` or
/// `FAIL_NOQUEUE` (SPEC_FULL §9: retained across retries by design).
pub struct AdjustableSemaphore {
    inner: Arc<Semaphore>,
    max: AtomicUsize,
}

impl AdjustableSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(max)),
            max: AtomicUsize::new(max),
        }
    }

    /// Acquires one permit, waiting indefinitely. The returned guard is
    /// forgotten immediately; callers track outstanding permits themselves
    /// and release via [`Self::release`], since a permit's lifetime here
    /// spans multiple independently scheduled retry tasks rather than one
    /// call stack.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Interrupted)?;
        permit.forget();
        Ok(())
    }

    /// Acquires one permit within `timeout`, returning [`Error::QueueFull`]
    /// on expiry.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.inner.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(Error::Interrupted),
            Err(_) => Err(Error::QueueFull),
        }
    }

    /// Acquires one permit only if immediately available.
    pub fn try_acquire(&self) -> Result<()> {
        match self.inner.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(Error::QueueFull),
        }
    }

    /// Returns a permit to the pool, unless doing so would push
    /// `available_permits()` past the configured max (spec.md §4.7:
    /// "never exceeding the configured maximum"). This is the case that
    /// matters after `set_max` shrinks the bound below the number of
    /// permits outstanding at the time of the shrink: those permits drain
    /// naturally as their holders call `release()`, but only up to the new
    /// max, with the rest simply not re-added.
    pub fn release(&self) {
        if self.inner.available_permits() < self.max.load(Ordering::SeqCst) {
            self.inner.add_permits(1);
        }
    }

    /// Resizes the bound, adjusting available permits by the delta so
    /// currently outstanding permits are unaffected.
    pub fn set_max(&self, new_max: usize) {
        let old_max = self.max.swap(new_max, Ordering::SeqCst);
        if new_max > old_max {
            self.inner.add_permits(new_max - old_max);
        } else {
            let shrink = old_max - new_max;
            // forget_permits only removes what's currently available; if the
            // bound shrinks below what's in flight, the excess is absorbed
            // the next time enough permits are released.
            self.inner.forget_permits(shrink);
        }
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_when_exhausted() {
        let sem = AdjustableSemaphore::new(1);
        sem.try_acquire().unwrap();
        assert!(matches!(sem.try_acquire(), Err(Error::QueueFull)));
    }

    #[tokio::test]
    async fn release_makes_permit_available_again() {
        let sem = AdjustableSemaphore::new(1);
        sem.try_acquire().unwrap();
        sem.release();
        sem.try_acquire().unwrap();
    }

    #[tokio::test]
    async fn acquire_timeout_expires_when_full() {
        let sem = AdjustableSemaphore::new(1);
        sem.try_acquire().unwrap();
        let result = sem.acquire_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::QueueFull)));
    }

    #[tokio::test]
    async fn set_max_grows_available_permits() {
        let sem = AdjustableSemaphore::new(1);
        sem.try_acquire().unwrap();
        sem.set_max(3);
        assert_eq!(sem.available(), 2);
    }

    #[tokio::test]
    async fn set_max_shrinks_available_permits() {
        let sem = AdjustableSemaphore::new(4);
        sem.set_max(1);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn release_after_shrink_below_outstanding_never_exceeds_new_max() {
        let sem = AdjustableSemaphore::new(4);
        for _ in 0..4 {
            sem.try_acquire().unwrap();
        }
        // All 4 permits are outstanding; shrinking to 2 can't claw any back
        // since none are currently available.
        sem.set_max(2);
        assert_eq!(sem.available(), 0);

        for _ in 0..4 {
            sem.release();
        }
        assert_eq!(sem.available(), 2);
        assert!(sem.available() <= sem.max());
    }
}
