//! Work queue between the producer and the consumer.
//!
//! Polling contract: the consumer checks `is_empty` / `get_item` and sleeps
//! between polls, the producer never waits on `add_item`.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::frame::ProcessingRequest;

/// FIFO of processing requests, `0 <= len <= capacity` at all times
#[derive(Debug)]
pub struct WorkQueue {
    tx: flume::Sender<ProcessingRequest>,
    rx: flume::Receiver<ProcessingRequest>,
    capacity: Option<usize>,
    closed: AtomicBool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl WorkQueue {
    /// Queue rejecting items once `capacity` requests are pending
    pub fn new(capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        };
        Self {
            tx,
            rx,
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Enqueue a request. Returns false when closed or full, never blocks.
    pub fn add_item(&self, request: ProcessingRequest) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.try_send(request).is_ok()
    }

    /// Dequeue the oldest pending request, `None` when empty
    pub fn get_item(&self) -> Option<ProcessingRequest> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Stop accepting new requests. Pending ones can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
