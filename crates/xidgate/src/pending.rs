//! Token-keyed result slots for in-flight requests.
//!
//! Every request gets a fresh [`RequestToken`] from a monotonically increasing
//! counter, so a token is never reused while a late reply for an older request
//! could still be in flight. The caller holds a [`PendingGuard`] for as long as
//! it waits; dropping the guard (on success, timeout or cancellation) unlinks
//! the slot. A completion for an unlinked token is handed back to whoever
//! produced it instead of being written into an abandoned slot.

use crate::{Error, Result};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Unique identifier of one in-flight request.
pub type RequestToken = u64;

/// Result slots keyed by request token.
pub struct PendingTable<T> {
    next: AtomicU64,
    slots: Mutex<HashMap<RequestToken, oneshot::Sender<Result<T>>>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links a new slot. The slot stays linked until the guard drops or the
    /// slot is completed.
    pub fn register(self: &Arc<Self>) -> (PendingGuard<T>, oneshot::Receiver<Result<T>>) {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(token, tx);
        let guard = PendingGuard {
            token,
            table: Arc::clone(self),
        };
        (guard, rx)
    }

    /// Delivers `value` to the waiter registered under `token`.
    ///
    /// Returns the value back when nobody is waiting for it any more, so the
    /// caller can reclaim whatever it carries.
    pub fn complete(&self, token: RequestToken, value: Result<T>) -> Option<Result<T>> {
        let Some(slot) = self.slots.lock().remove(&token) else {
            return Some(value);
        };
        slot.send(value).err()
    }

    /// Returns `true` while a waiter is linked under `token`.
    pub fn is_waiting(&self, token: RequestToken) -> bool {
        self.slots
            .lock()
            .get(&token)
            .is_some_and(|slot| !slot.is_closed())
    }

    /// Fails every linked waiter with `err`. Returns how many were woken.
    pub fn fail_all(&self, err: &Error) -> usize {
        let slots: Vec<_> = self.slots.lock().drain().collect();
        slots
            .into_iter()
            .filter_map(|(_, slot)| slot.send(Err(err.clone())).ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn unlink(&self, token: RequestToken) {
        self.slots.lock().remove(&token);
    }
}

impl<T> core::fmt::Debug for PendingTable<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingTable")
            .field("len", &self.len())
            .finish()
    }
}

/// Keeps a pending slot linked. Dropping it unlinks the slot.
#[must_use = "dropping the guard abandons the request"]
pub struct PendingGuard<T> {
    token: RequestToken,
    table: Arc<PendingTable<T>>,
}

impl<T> PendingGuard<T> {
    pub const fn token(&self) -> RequestToken {
        self.token
    }
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        self.table.unlink(self.token);
    }
}

impl<T> core::fmt::Debug for PendingGuard<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PendingGuard").field(&self.token).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_registered_waiter() {
        let table = Arc::new(PendingTable::<u32>::new());
        let (guard, rx) = table.register();
        assert!(table.is_waiting(guard.token()));

        assert!(table.complete(guard.token(), Ok(7)).is_none());
        assert_eq!(rx.await.unwrap(), Ok(7));
        assert!(table.is_empty());
    }

    #[test]
    fn tokens_are_never_reused() {
        let table = Arc::new(PendingTable::<()>::new());
        let first = table.register().0.token();
        let second = table.register().0.token();
        assert_ne!(first, second);
        assert!(table.is_empty());
    }

    #[test]
    fn late_completion_is_handed_back() {
        let table = Arc::new(PendingTable::<u32>::new());
        let (guard, rx) = table.register();
        let token = guard.token();
        drop(guard);
        drop(rx);

        assert!(!table.is_waiting(token));
        assert_eq!(table.complete(token, Ok(3)), Some(Ok(3)));
    }

    #[test]
    fn dropped_receiver_hands_value_back() {
        let table = Arc::new(PendingTable::<u32>::new());
        let (guard, rx) = table.register();
        drop(rx);

        assert!(!table.is_waiting(guard.token()));
        assert_eq!(table.complete(guard.token(), Ok(9)), Some(Ok(9)));
    }

    #[tokio::test]
    async fn fail_all_wakes_everyone() {
        let table = Arc::new(PendingTable::<u32>::new());
        let (_g1, rx1) = table.register();
        let (_g2, rx2) = table.register();

        assert_eq!(table.fail_all(&Error::ServiceShutdown), 2);
        assert_eq!(rx1.await.unwrap(), Err(Error::ServiceShutdown));
        assert_eq!(rx2.await.unwrap(), Err(Error::ServiceShutdown));
    }
}
