//! Outbound queue between the delivery worker and the transport.
//!
//! Bounded FIFO of serialized events. `push` waits for room instead of
//! growing without limit when the transport stalls.

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Outbound queue is closed")]
    Closed,
}

/// Producer handle. Cloneable; the queue closes when every handle is dropped.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Vec<u8>>,
}

/// Create a queue holding at most `capacity` events (minimum 1).
pub fn outbound_queue(capacity: usize) -> (OutboundQueue, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundQueue { tx }, rx)
}

impl OutboundQueue {
    /// Enqueue one serialized event, waiting while the queue is full.
    pub async fn push(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        self.tx.send(payload).await.map_err(|_| QueueError::Closed)
    }

    /// True once the consumer has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
