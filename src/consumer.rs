//! Consumer and expiration callbacks (C4 input surface).
//!
//! Both follow the same shape: a native `async fn` trait for callers writing
//! `impl Consumer<T> for MyHandler`, plus an object-safe `*Boxed` companion
//! the worker pool actually stores, with a blanket impl bridging the two.
//! This mirrors the teacher's `SpanExporter`/`SpanExporterBoxed` pair.

use std::future::Future;
use std::pin::Pin;

/// Outcome of handing one item to a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Processing succeeded; the item is durably removed.
    Ack,
    /// Processing failed but may succeed later; re-enter the retry scheduler.
    FailRequeue,
    /// Processing failed and must not be retried; the item is durably removed.
    FailNoRequeue,
}

/// User-supplied processing logic for one queue item.
pub trait Consumer<T>: Send + Sync + 'static {
    fn consume(&self, item: &T) -> impl Future<Output = Verdict> + Send;
}

/// Object-safe counterpart of [`Consumer`], used internally by the worker pool.
pub trait ConsumerBoxed<T>: Send + Sync + 'static {
    fn consume_boxed<'a>(&'a self, item: &'a T) -> Pin<Box<dyn Future<Output = Verdict> + Send + 'a>>;
}

impl<T, C> ConsumerBoxed<T> for C
where
    C: Consumer<T>,
{
    fn consume_boxed<'a>(&'a self, item: &'a T) -> Pin<Box<dyn Future<Output = Verdict> + Send + 'a>> {
        Box::pin(self.consume(item))
    }
}

/// Called when an item's `tryCount` reaches `maxTries` (SPEC_FULL §4.5)
/// instead of being silently dropped.
pub trait Expiration<T>: Send + Sync + 'static {
    fn expire(&self, item: &T) -> impl Future<Output = ()> + Send;
}

/// Object-safe counterpart of [`Expiration`].
pub trait ExpirationBoxed<T>: Send + Sync + 'static {
    fn expire_boxed<'a>(&'a self, item: &'a T) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl<T, E> ExpirationBoxed<T> for E
where
    E: Expiration<T>,
{
    fn expire_boxed<'a>(&'a self, item: &'a T) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.expire(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingConsumer {
        seen: Arc<AtomicUsize>,
    }

    impl Consumer<u32> for CountingConsumer {
        async fn consume(&self, item: &u32) -> Verdict {
            self.seen.fetch_add(*item as usize, Ordering::SeqCst);
            Verdict::Ack
        }
    }

    #[tokio::test]
    async fn boxed_bridge_invokes_native_impl() {
        let seen = Arc::new(AtomicUsize::new(0));
        let consumer = CountingConsumer { seen: seen.clone() };
        let boxed: &dyn ConsumerBoxed<u32> = &consumer;

        let verdict = boxed.consume_boxed(&5).await;

        assert_eq!(verdict, Verdict::Ack);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
