//! Bounded sequential delivery queues.
//!
//! Each queue owns one worker task. Items are processed strictly in push
//! order and the worker does not take the next item until the current one
//! has finished, so a slow consumer back-pressures the producer once the
//! queue holds `depth` items.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Consumes the items of a [`DeliveryQueue`].
#[async_trait]
pub trait Processor<T: Send + 'static>: Send + 'static {
    /// Handles one item. Returns once the item is fully processed.
    async fn process(&mut self, item: T);

    /// Called once after the last item, when every sender is gone.
    async fn finish(&mut self) {}
}

/// The worker behind a queue has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("delivery queue closed")]
pub struct QueueClosed;

/// Sending half of a bounded sequential queue.
pub struct DeliveryQueue<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for DeliveryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> DeliveryQueue<T> {
    /// Spawns the worker and returns the queue handle.
    ///
    /// The worker exits after every clone of the handle has been dropped and
    /// the remaining items have been drained.
    pub fn spawn<P>(name: &'static str, depth: usize, mut processor: P) -> (Self, JoinHandle<()>)
    where
        P: Processor<T>,
    {
        let (tx, mut rx) = mpsc::channel::<T>(depth.max(1));

        let worker = tokio::spawn(async move {
            trace!(queue = name, "Delivery queue started");
            while let Some(item) = rx.recv().await {
                processor.process(item).await;
            }
            processor.finish().await;
            debug!(queue = name, "Delivery queue drained");
        });

        (Self { tx }, worker)
    }

    /// Enqueues an item, waiting while the queue is full.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.tx.send(item).await.map_err(|_| QueueClosed)
    }

    /// Waits for capacity and holds it until the returned slot is filled.
    ///
    /// Filling the slot never waits, so it can happen under a lock.
    pub async fn reserve(&self) -> Result<QueueSlot<'_, T>, QueueClosed> {
        self.tx
            .reserve()
            .await
            .map(|permit| QueueSlot { permit })
            .map_err(|_| QueueClosed)
    }

    /// Enqueues an item without waiting. Fails when the queue is full or
    /// closed and hands the item back.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(item) => item,
            mpsc::error::TrySendError::Closed(item) => item,
        })
    }

    /// Returns whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Capacity reserved in a [`DeliveryQueue`].
pub struct QueueSlot<'a, T> {
    permit: mpsc::Permit<'a, T>,
}

impl<T> QueueSlot<'_, T> {
    pub fn fill(self, item: T) {
        self.permit.send(item);
    }
}
