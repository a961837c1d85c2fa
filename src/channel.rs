//! Bounded channel primitive
//!
//! A fixed-capacity FIFO queue shared between any number of senders and
//! receivers. Every data-plane hop (worker outputs, broadcaster subscribers,
//! demodulator audio) goes through one of these.
//!
//! The queue itself is a `crossbeam_channel::bounded` pair. Both ends live in
//! one shared handle, so any clone may send, receive or
//! [`drain`](BoundedChannel::drain) the queue. The lifecycle managers rely on
//! this to discard buffered chunks that were computed against a stale device
//! configuration without owning the consumer's receiving end. Async waiting
//! is layered on top with two [`Notify`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::Notify;

/// Error returned by [`BoundedChannel::try_send`]
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The queue is at capacity; the item is handed back
    Full(T),
    /// The channel was closed; the item is handed back
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Closed(item) => item,
        }
    }
}

/// Error returned by [`BoundedChannel::try_recv`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing queued right now
    Empty,
    /// Channel closed and fully drained
    Closed,
}

/// Error returned by [`BoundedChannel::send`] when the channel is closed
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

struct Inner<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    closed: AtomicBool,
    items: Notify,
    space: Notify,
}

/// Fixed-capacity multi-producer, multi-consumer queue
pub struct BoundedChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> BoundedChannel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                capacity,
                closed: AtomicBool::new(false),
                items: Notify::new(),
                space: Notify::new(),
            }),
        }
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of currently queued items
    pub fn len(&self) -> usize {
        self.inner.rx.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.inner.rx.is_empty()
    }

    /// Whether the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.inner.tx.is_full()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Enqueue without waiting
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(item));
        }

        match self.inner.tx.try_send(item) {
            Ok(()) => {
                self.inner.items.notify_one();
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Full(item)) => Err(TrySendError::Full(item)),
            // Both ends live in `inner`, so this only happens while it is torn down
            Err(crossbeam_channel::TrySendError::Disconnected(item)) => Err(TrySendError::Closed(item)),
        }
    }

    /// Enqueue, waiting for free space if the queue is full
    pub async fn send(&self, mut item: T) -> Result<(), SendError<T>> {
        loop {
            let notified = self.inner.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(rejected)) => return Err(SendError(rejected)),
                Err(TrySendError::Full(rejected)) => item = rejected,
            }

            notified.await;
        }
    }

    /// Dequeue without waiting
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.inner.rx.try_recv() {
            Ok(item) => {
                self.inner.space.notify_one();
                Ok(item)
            }
            Err(crossbeam_channel::TryRecvError::Empty) if !self.is_closed() => Err(TryRecvError::Empty),
            Err(_) => Err(TryRecvError::Closed),
        }
    }

    /// Dequeue, waiting for an item
    ///
    /// Returns `None` once the channel is closed and everything queued before
    /// the close has been received.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => {}
            }

            notified.await;
        }
    }

    /// Wait until an item is queued without taking it
    ///
    /// Returns `false` once the channel is closed and empty. Another receiver
    /// may still take the item before the caller does.
    pub async fn readable(&self) -> bool {
        loop {
            let notified = self.inner.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_empty() {
                return true;
            }
            if self.is_closed() {
                return false;
            }

            notified.await;
        }
    }

    /// Discard everything currently queued, returning how many items were dropped
    pub fn drain(&self) -> usize {
        let dropped = self.inner.rx.try_iter().count();
        if dropped > 0 {
            self.inner.space.notify_waiters();
        }
        dropped
    }

    /// Close the channel
    ///
    /// Pending and future `send`s fail; receivers still get the items that
    /// were queued before the close.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.items.notify_waiters();
        self.inner.space.notify_waiters();
    }
}
