use crate::{Result, TransactionId, Upstream};
use parking_lot::Mutex;
use std::sync::Arc;

/// The root id source on the authority.
///
/// Hands out contiguous ids starting at a configured first id, skipping the
/// invalid sentinel when the counter wraps. Nothing is persisted: a restarted
/// authority starts over from its configured first id.
#[derive(Debug, Clone)]
pub struct LocalLedger {
    next: Arc<Mutex<TransactionId>>,
}

impl Default for LocalLedger {
    fn default() -> Self {
        Self::starting_at(TransactionId::FIRST)
    }
}

impl LocalLedger {
    /// Creates a ledger whose first id is `first`. `0` is bumped to
    /// [`TransactionId::FIRST`].
    pub fn starting_at(first: TransactionId) -> Self {
        let first = if first.is_valid() {
            first
        } else {
            TransactionId::FIRST
        };
        Self {
            next: Arc::new(Mutex::new(first)),
        }
    }

    /// The id the next issue would return.
    pub fn peek(&self) -> TransactionId {
        *self.next.lock()
    }

    /// Issues `count` contiguous ids.
    pub fn issue(&self, count: usize) -> Vec<TransactionId> {
        let mut next = self.next.lock();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(*next);
            *next = next.next();
        }
        ids
    }
}

impl Upstream for LocalLedger {
    fn is_ready(&self) -> bool {
        true
    }

    fn generation(&self) -> u64 {
        0
    }

    async fn request_batch(&self, count: usize) -> Result<Vec<TransactionId>> {
        Ok(self.issue(count))
    }

    async fn request_one(&self) -> Result<TransactionId> {
        let mut next = self.next.lock();
        let id = *next;
        *next = next.next();
        Ok(id)
    }

    async fn finish(&self, _id: TransactionId, _committed: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_contiguous_ids_across_wraparound() {
        let ledger = LocalLedger::starting_at(TransactionId::from_raw(u32::MAX - 1));
        let raw: Vec<_> = ledger.issue(4).into_iter().map(u32::from).collect();
        assert_eq!(raw, vec![u32::MAX - 1, u32::MAX, 1, 2]);
        assert_eq!(ledger.peek(), TransactionId::from_raw(3));
    }

    #[test]
    fn zero_start_is_bumped() {
        let ledger = LocalLedger::starting_at(TransactionId::INVALID);
        assert_eq!(ledger.issue(1), vec![TransactionId::FIRST]);
    }

    #[tokio::test]
    async fn clones_share_the_counter() {
        let ledger = LocalLedger::default();
        let other = ledger.clone();
        assert_eq!(ledger.request_one().await, Ok(TransactionId::from_raw(1)));
        assert_eq!(other.request_one().await, Ok(TransactionId::from_raw(2)));
    }
}
