//! Fixed-capacity FIFO used between request paths and service loops.
//!
//! A [`BoundedMailbox`] has many producers and a single draining owner.
//! Producers that find the mailbox full wait on a FIFO queue of waiters until
//! the owner drains it or their deadline passes. The owner never pops items
//! one at a time: [`BoundedMailbox::drain_all`] takes everything that is queued
//! and releases all of the freed slots at once, waking waiting producers in
//! arrival order.
//!
//! Waiting producers are parked on a [`Semaphore`] whose permits track free
//! slots. A producer that times out or is cancelled drops its pending acquire,
//! which unlinks it from the waiter queue; no stale waiter is ever woken into
//! an abandoned slot.

use crate::Error;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::time::{Instant, timeout_at};

/// Why a push did not enqueue. The rejected item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The mailbox was at capacity (non-blocking push only).
    Full(T),
    /// The deadline elapsed before a slot freed up.
    Timeout(T),
    /// The owner closed the mailbox.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recovers the item that was not enqueued.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Timeout(item) | Self::Closed(item) => item,
        }
    }

    /// Maps the rejection onto the crate error taxonomy.
    pub fn into_error(self, capacity: usize) -> Error {
        match self {
            Self::Full(_) => Error::CapacityExceeded { capacity },
            Self::Timeout(_) => Error::Timeout,
            Self::Closed(_) => Error::ServiceShutdown,
        }
    }
}

/// A bounded multi-producer mailbox with a single draining owner.
pub struct BoundedMailbox<T> {
    queue: Mutex<VecDeque<T>>,
    slots: Semaphore,
    ready: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl<T> BoundedMailbox<T> {
    /// Creates a mailbox holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueues `item` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] at capacity and [`PushError::Closed`] after
    /// [`Self::close`].
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.enqueue(item);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(PushError::Full(item)),
            Err(TryAcquireError::Closed) => Err(PushError::Closed(item)),
        }
    }

    /// Enqueues `item`, waiting as long as it takes for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] if the mailbox is closed while waiting.
    pub async fn push(&self, item: T) -> Result<(), PushError<T>> {
        match self.slots.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.enqueue(item);
                Ok(())
            }
            Err(_) => Err(PushError::Closed(item)),
        }
    }

    /// Enqueues `item`, waiting for a free slot until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Timeout`] when the deadline passes first and
    /// [`PushError::Closed`] if the mailbox is closed while waiting.
    pub async fn push_until(&self, item: T, deadline: Instant) -> Result<(), PushError<T>> {
        match timeout_at(deadline, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.enqueue(item);
                Ok(())
            }
            Ok(Err(_)) => Err(PushError::Closed(item)),
            Err(_) => Err(PushError::Timeout(item)),
        }
    }

    /// Removes every queued item and wakes waiting producers.
    ///
    /// Only the owning service loop should call this.
    pub fn drain_all(&self) -> Vec<T> {
        let drained: Vec<T> = self.queue.lock().drain(..).collect();
        if !drained.is_empty() && !self.is_closed() {
            self.slots.add_permits(drained.len());
        }
        drained
    }

    /// Waits until at least one item is queued, then drains the mailbox.
    ///
    /// Returns `None` once the mailbox is closed and empty. Cancel safe: items
    /// are only removed in the same poll that returns them.
    pub async fn recv_all(&self) -> Option<Vec<T>> {
        loop {
            let notified = self.ready.notified();
            let batch = self.drain_all();
            if !batch.is_empty() {
                return Some(batch);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Closes the mailbox. Pending and future pushes fail with
    /// [`PushError::Closed`]; already-queued items can still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        self.ready.notify_one();
    }

    fn enqueue(&self, item: T) {
        self.queue.lock().push_back(item);
        self.ready.notify_one();
    }
}

impl<T> core::fmt::Debug for BoundedMailbox<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundedMailbox")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
