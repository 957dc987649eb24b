// SPDX-License-Identifier: AGPL-3.0-or-later

use std::mem;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::errors::QueueError;

/// Reused drain buffers above this capacity get dropped instead of kept around.
const MAX_REUSE_CAPACITY: usize = 1024;

/// Capacity the internal buffer starts with after a drain.
const INITIAL_CAPACITY: usize = 32;

#[derive(Debug)]
struct Inner<T> {
    buffer: Vec<T>,
    closed: bool,
}

/// Bounded, growable queue decoupling producers from one batch-consuming reader.
///
/// Pushing never blocks: when the queue holds `max_size` items the push fails with
/// [`QueueError::BufferFull`] and the producer decides what to do about it. The reader waits on
/// a coalesced signal, so one wake-up can stand for many pushes and it has to drain in a loop.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    signal: Notify,
    max_size: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: Vec::with_capacity(INITIAL_CAPACITY.min(max_size)),
                closed: false,
            }),
            signal: Notify::new(),
            max_size,
        }
    }

    /// Adds an item to the end of the queue.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock();

            if inner.closed {
                return Err(QueueError::Unavailable);
            }

            if inner.buffer.len() >= self.max_size {
                return Err(QueueError::BufferFull);
            }

            inner.buffer.push(item);
        }

        // Stores a permit when nobody is waiting right now, so a push between `drain_batch` and
        // `wait` is never missed
        self.signal.notify_one();

        Ok(())
    }

    /// Takes out everything pushed since the last drain, in push order.
    ///
    /// The given vector gets cleared and becomes the new internal storage when its capacity is
    /// reasonable. Returns `None` once the queue is closed.
    pub fn drain_batch(&self, mut reuse: Vec<T>) -> Option<Vec<T>> {
        reuse.clear();
        if reuse.capacity() > MAX_REUSE_CAPACITY {
            reuse = Vec::with_capacity(INITIAL_CAPACITY);
        }

        let mut inner = self.inner.lock();

        if inner.closed {
            return None;
        }

        Some(mem::replace(&mut inner.buffer, reuse))
    }

    /// Resolves after at least one push happened since the last time it resolved, or when the
    /// queue got closed.
    pub async fn wait(&self) {
        if self.is_closed() {
            return;
        }

        self.signal.notified().await;
    }

    /// Discards all pending items. Every following push fails with
    /// [`QueueError::Unavailable`].
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            inner.closed = true;
            inner.buffer = Vec::new();
        }

        self.signal.notify_waiters();
        self.signal.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
