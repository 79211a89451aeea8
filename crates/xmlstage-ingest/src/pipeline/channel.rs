//! Bounded FIFO hand-off between stages
//!
//! A thin layer over `tokio::sync::mpsc` that adds what the pipeline needs:
//! a shared multi-consumer receiver for the worker pool, idempotent close on
//! both ends, and a depth gauge with a high-water mark.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Current and peak number of buffered items.
#[derive(Debug, Default)]
pub struct DepthGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl DepthGauge {
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn observe(&self, depth: usize) {
        self.current.store(depth, Ordering::Relaxed);
        self.peak.fetch_max(depth, Ordering::Relaxed);
    }
}

/// Returned by [`BoundedSender::send`] when the receiving side is gone or
/// closed. Carries the item back.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

impl<T> Closed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Create a channel holding at most `capacity` items.
pub fn bounded<T>(capacity: usize, gauge: Arc<DepthGauge>) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = BoundedSender {
        inner: Some(tx),
        gauge: gauge.clone(),
    };
    let receiver = BoundedReceiver {
        inner: Arc::new(Mutex::new(rx)),
        closed: CancellationToken::new(),
        gauge,
    };
    (sender, receiver)
}

/// The single producing end.
pub struct BoundedSender<T> {
    inner: Option<mpsc::Sender<T>>,
    gauge: Arc<DepthGauge>,
}

impl<T> BoundedSender<T> {
    /// Waits while the channel is full.
    pub async fn send(&self, item: T) -> Result<(), Closed<T>> {
        let Some(tx) = &self.inner else {
            return Err(Closed(item));
        };
        match tx.send(item).await {
            Ok(()) => {
                self.gauge.observe(tx.max_capacity() - tx.capacity());
                Ok(())
            },
            Err(mpsc::error::SendError(item)) => Err(Closed(item)),
        }
    }

    /// Signal end of stream. Receivers drain what is buffered, then see `None`.
    pub fn close(&mut self) {
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.as_ref().map_or(true, mpsc::Sender::is_closed)
    }
}

/// The consuming end. Clones share one queue; each item is delivered to
/// exactly one of them.
pub struct BoundedReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
    closed: CancellationToken,
    gauge: Arc<DepthGauge>,
}

impl<T> Clone for BoundedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            closed: self.closed.clone(),
            gauge: self.gauge.clone(),
        }
    }
}

impl<T> BoundedReceiver<T> {
    /// Waits while the channel is empty. `None` once the sender is closed (or
    /// this side was closed) and the buffer is drained.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.inner.lock().await;
        if self.closed.is_cancelled() {
            rx.close();
        }

        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = self.closed.cancelled() => {
                rx.close();
                rx.recv().await
            },
        };

        self.gauge.observe(rx.len());
        item
    }

    /// Refuse further items. Blocked and future sends fail with [`Closed`];
    /// already buffered items can still be received.
    pub async fn close(&self) {
        self.closed.cancel();
        self.inner.lock().await.close();
    }

    pub fn len(&self) -> usize {
        self.gauge.current()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_and_drain_after_close() {
        let gauge = Arc::new(DepthGauge::default());
        let (mut tx, rx) = bounded(4, gauge.clone());
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }
        tx.close();
        tx.close();
        assert!(tx.is_closed());
        assert!(tx.send(99).await.is_err());

        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.recv().await, None);
        assert_eq!(gauge.peak(), 3);
        assert_eq!(gauge.current(), 0);
    }

    #[tokio::test]
    async fn test_send_blocks_when_full() {
        let (tx, rx) = bounded(2, Arc::new(DepthGauge::default()));
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), tx.send(3)).await;
        assert!(blocked.is_err(), "third send should wait for space");

        assert_eq!(rx.recv().await, Some(1));
        timeout(Duration::from_millis(500), tx.send(3)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_receiver_close_unblocks_sender() {
        let (tx, rx) = bounded(1, Arc::new(DepthGauge::default()));
        tx.send(1).await.unwrap();

        let sender = tokio::spawn(async move { tx.send(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        rx.close().await;
        rx.close().await;

        let result = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
        assert_eq!(result, Err(Closed(2)));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_while_another_consumer_waits() {
        let (_tx, rx) = bounded::<u32>(1, Arc::new(DepthGauge::default()));
        let waiting = rx.clone();
        let waiter = tokio::spawn(async move { waiting.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(1), rx.close()).await.unwrap();
        assert_eq!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_each_item_delivered_once_across_consumers() {
        let gauge = Arc::new(DepthGauge::default());
        let (mut tx, rx) = bounded(8, gauge.clone());

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(v) = rx.recv().await {
                        got.push(v);
                    }
                    got
                })
            })
            .collect();
        drop(rx);

        for i in 0..1_000u32 {
            tx.send(i).await.unwrap();
        }
        tx.close();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..1_000).collect::<Vec<_>>());
        assert!(gauge.peak() <= 8);
    }
}
