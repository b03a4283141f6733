use crate::{TransactionId, xid::sort_circular};

/// Ids granted by the authority but not yet handed to a caller.
///
/// The pool is a stack: ids are stored newest-first and popped from the end,
/// so callers receive them oldest-first. Every merged batch is re-sorted under
/// circular ordering, which keeps hand-out order ascending even when batches
/// arrive out of order or straddle the wraparound point.
#[derive(Debug, Clone, Default)]
pub struct PreAllocationPool {
    // Newest first; `pop` takes the oldest from the tail.
    ids: Vec<TransactionId>,
    target: usize,
}

impl PreAllocationPool {
    /// Creates an empty pool that replenishes towards `target` ids.
    ///
    /// A target of `0` disables pre-allocation entirely.
    pub fn new(target: usize) -> Self {
        Self {
            ids: Vec::with_capacity(target),
            target,
        }
    }

    pub const fn target(&self) -> usize {
        self.target
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns `true` when occupancy is at or below half of the target.
    pub fn is_low(&self) -> bool {
        self.target > 0 && self.ids.len() <= self.target / 2
    }

    /// Size of the batch needed to fill the pool to its target (at least 1).
    pub fn deficit(&self) -> usize {
        self.target.saturating_sub(self.ids.len()).max(1)
    }

    /// Merges a granted batch. Invalid ids are discarded.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = TransactionId>) {
        self.ids.extend(batch.into_iter().filter(|id| id.is_valid()));
        sort_circular(&mut self.ids);
        self.ids.reverse();
    }

    /// Takes the oldest pooled id.
    pub fn pop(&mut self) -> Option<TransactionId> {
        self.ids.pop()
    }

    /// Takes up to `n` of the oldest pooled ids, oldest first.
    pub fn take(&mut self, n: usize) -> Vec<TransactionId> {
        let split = self.ids.len().saturating_sub(n);
        let mut taken = self.ids.split_off(split);
        taken.reverse();
        taken
    }

    /// The id the next [`Self::pop`] would return.
    pub fn peek(&self) -> Option<TransactionId> {
        self.ids.last().copied()
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.ids.contains(&id)
    }

    /// Drops every pooled id, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.ids.len();
        self.ids.clear();
        n
    }

    /// Pooled ids in hand-out order.
    pub fn iter(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.ids.iter().rev().copied()
    }
}
