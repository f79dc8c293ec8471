//! Blocking primitives for the node pipelines: monotonic counter
//! semaphores and the bounded segment queue feeding compute.
//!
//! These two are the only suspension points in the engine. Every wait is
//! bounded; a wait that elapses surfaces as a liveness error at the call
//! site rather than hanging the collective.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

/// Outcome of a bounded wait on a queue endpoint.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The wait exceeded its bound.
    TimedOut,
    /// The other endpoint was dropped.
    Closed,
}

/// A monotonically increasing counter with awaitable thresholds.
///
/// Serves both as an intra-node ready signal and as an inter-node
/// credit/rendezvous signal. Waiters observe the counter through a watch
/// channel, so increments are never lost: a waiter whose threshold was
/// already passed returns immediately.
#[derive(Debug, Clone)]
pub struct Counter {
    tx: Arc<watch::Sender<u64>>,
}

impl Counter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Advance the counter by one and wake all waiters.
    pub fn increment(&self) {
        self.tx.send_modify(|v| *v += 1);
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Zero the counter. Only safe once every waiter whose threshold the
    /// old value satisfied has observed it; the engine never resets
    /// mid-collective.
    pub fn reset(&self) {
        self.tx.send_modify(|v| *v = 0);
    }

    /// Wait until the counter reaches `target`. Returns false if the
    /// bound elapses first.
    pub async fn wait_at_least(&self, target: u64, timeout: Duration) -> bool {
        if *self.tx.borrow() >= target {
            return true;
        }
        let mut rx = self.tx.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|v| *v >= target)).await;
        matches!(result, Ok(Ok(_)))
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a bounded FIFO for segment hand-off between a transport role
/// and compute.
///
/// Capacity is one step's worth of segments, which makes a full
/// reservation double as the inter-step credit: a producer cannot reserve
/// space for step g+1 until the consumer drained every segment of step g.
pub fn segment_queue<T>(capacity: usize) -> (SegmentProducer<T>, SegmentConsumer<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (SegmentProducer { tx }, SegmentConsumer { rx })
}

/// Producing endpoint. Cloned across the two transport roles; only the
/// step's passive receiver pushes, so the queue stays single-producer in
/// any given step.
#[derive(Debug)]
pub struct SegmentProducer<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for SegmentProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> SegmentProducer<T> {
    /// Reserve `n` slots, waiting until the consumer has freed enough.
    /// The returned permits push without further blocking.
    pub async fn reserve(
        &self,
        n: usize,
        timeout: Duration,
    ) -> Result<mpsc::PermitIterator<'_, T>, QueueError> {
        match tokio::time::timeout(timeout, self.tx.reserve_many(n)).await {
            Ok(Ok(permits)) => Ok(permits),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::TimedOut),
        }
    }
}

/// Consuming endpoint, held by the compute role.
#[derive(Debug)]
pub struct SegmentConsumer<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> SegmentConsumer<T> {
    /// Pop the front item, waiting until one is present.
    pub async fn pop(&mut self, timeout: Duration) -> Result<T, QueueError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::TimedOut),
        }
    }
}
