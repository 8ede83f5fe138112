//! Bounded outbound queues.
//!
//! Every network session owns one [`Outbox`] and the user session owns one
//! more for account-level replies. Producers block when a queue is full;
//! that is how a slow client pushes back on a network's event processing.
//! At most one consumer drains a queue at a time. A closed outbox drops
//! new items and tells its consumer to let go.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};

use crate::protocol::Payload;

/// Exclusive read access to an outbox, held by one delivery forwarder.
pub type OutboxReader = OwnedMutexGuard<mpsc::Receiver<Payload>>;

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Payload>,
    rx: Arc<Mutex<mpsc::Receiver<Payload>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            closed: Arc::new(watch::channel(false).0),
        }
    }

    /// Enqueue, waiting for room. Dropped once the outbox is closed, even
    /// while waiting.
    pub async fn push(&self, payload: Payload) {
        if self.is_closed() {
            return;
        }
        // The receiver lives in `self`, so the send cannot fail.
        tokio::select! {
            _ = self.tx.send(payload) => {}
            _ = self.closed() => {}
        }
    }

    /// Put back an item a consumer failed to deliver.
    ///
    /// Never blocks the caller. When the queue is full the item is handed to
    /// a task that waits for room, so it lands behind whatever is queued.
    pub fn requeue(&self, payload: Payload) {
        match self.tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(payload)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(payload).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Mark the queue dead: its producer is gone for good.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Take the consumer side. Waits while another consumer holds it.
    pub async fn take(&self) -> OutboxReader {
        self.rx.clone().lock_owned().await
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
