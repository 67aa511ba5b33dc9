//! In-process transfer channel (C3).
//!
//! A bounded MPMC rendezvous between the pump and the worker pool, capacity
//! fixed to `workerCount` so at most one dispatched entry sits per worker at
//! a time (SPEC_FULL §4.3). Built on `flume`, the bounded MPMC channel this
//! pack's `veloce` depends on — the teacher's own `ringmpsc`/`ringmpsc-stream`
//! channels are per-producer SPSC rings and don't model "any producer, any of
//! N consumers" directly.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// An item in flight between the pump and a worker.
pub struct Dispatched<T> {
    pub key: u64,
    pub item: T,
}

/// Bounded transfer channel, closed exactly once.
pub struct TransferChannel<T> {
    tx: Mutex<Option<flume::Sender<Dispatched<T>>>>,
    rx: flume::Receiver<Dispatched<T>>,
}

impl<T: Send + 'static> TransferChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Blocks until a worker takes `item`, or the channel closes underneath it.
    pub async fn offer(&self, key: u64, item: T) -> Result<()> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send_async(Dispatched { key, item })
                .await
                .map_err(|_| Error::Interrupted),
            None => Err(Error::Interrupted),
        }
    }

    /// Takes the next dispatched item, or `None` once the channel is closed
    /// and drained.
    pub async fn take(&self) -> Option<Dispatched<T>> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking counterpart of [`Self::offer`], used by `submit`'s fast
    /// path (SPEC_FULL §4.3): `true` iff a slot was free, i.e. an idle
    /// worker was waiting. On failure the item is handed back so the caller
    /// can fall through to the spill store without losing it.
    pub fn try_offer(&self, key: u64, item: T) -> std::result::Result<(), T> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => match tx.try_send(Dispatched { key, item }) {
                Ok(()) => Ok(()),
                Err(flume::TrySendError::Full(d)) => Err(d.item),
                Err(flume::TrySendError::Disconnected(d)) => Err(d.item),
            },
            None => Err(item),
        }
    }

    /// Closes the sending half. Idempotent: later calls are no-ops. Items
    /// already queued are still deliverable to `take()`.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_then_take_round_trips() {
        let chan: TransferChannel<String> = TransferChannel::new(2);
        chan.offer(0, "hello".to_string()).await.unwrap();

        let dispatched = chan.take().await.unwrap();
        assert_eq!(dispatched.key, 0);
        assert_eq!(dispatched.item, "hello");
    }

    #[tokio::test]
    async fn capacity_bounds_outstanding_offers() {
        let chan: TransferChannel<u32> = TransferChannel::new(1);
        chan.offer(0, 10).await.unwrap();

        let blocked = tokio::time::timeout(std::time::Duration::from_millis(50), chan.offer(1, 20)).await;
        assert!(blocked.is_err(), "second offer should block while full");

        chan.take().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_offers() {
        let chan: TransferChannel<u32> = TransferChannel::new(4);
        chan.offer(0, 1).await.unwrap();
        chan.close();
        chan.close();

        assert!(chan.offer(1, 2).await.is_err());

        // the entry queued before close is still deliverable.
        let dispatched = chan.take().await.unwrap();
        assert_eq!(dispatched.key, 0);
        assert!(chan.take().await.is_none());
    }

    #[tokio::test]
    async fn try_offer_succeeds_while_capacity_remains() {
        let chan: TransferChannel<u32> = TransferChannel::new(1);
        assert!(chan.try_offer(0, 7).is_ok());
        let dispatched = chan.take().await.unwrap();
        assert_eq!(dispatched.item, 7);
    }

    #[tokio::test]
    async fn try_offer_hands_item_back_when_full() {
        let chan: TransferChannel<u32> = TransferChannel::new(1);
        chan.try_offer(0, 1).unwrap();
        let returned = chan.try_offer(1, 2).unwrap_err();
        assert_eq!(returned, 2);
    }

    #[tokio::test]
    async fn try_offer_hands_item_back_when_closed() {
        let chan: TransferChannel<u32> = TransferChannel::new(4);
        chan.close();
        let returned = chan.try_offer(0, 9).unwrap_err();
        assert_eq!(returned, 9);
    }
}
