use crate::{BootstrapSnapshot, Error, NodeId, Result, TransactionId, xid::sort_circular};
use std::collections::HashMap;
use tokio::time::Instant;

/// Bookkeeping for one outstanding id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    /// The node the id was granted to.
    pub owner: NodeId,
    /// When the id was granted.
    pub since: Instant,
}

/// Ids handed to some caller and not yet reported finished.
#[derive(Debug, Default, Clone)]
pub struct OutstandingSet {
    ids: HashMap<TransactionId, Holder>,
}

impl OutstandingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.ids.contains_key(&id)
    }

    /// Records `id` as outstanding for `owner`. Returns `false` if it already
    /// was.
    pub fn insert(&mut self, id: TransactionId, owner: NodeId) -> bool {
        debug_assert!(id.is_valid(), "invalid xid recorded as outstanding");
        self.ids
            .insert(
                id,
                Holder {
                    owner,
                    since: Instant::now(),
                },
            )
            .is_none()
    }

    /// Removes a finished id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleCompletion`] if `id` is not outstanding.
    pub fn finish(&mut self, id: TransactionId) -> Result<Holder> {
        self.ids
            .remove(&id)
            .ok_or(Error::StaleCompletion { xid: id })
    }

    /// Forgets every outstanding id, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.ids.len();
        self.ids.clear();
        n
    }

    /// The oldest outstanding id under circular ordering.
    pub fn oldest(&self) -> Option<TransactionId> {
        self.ids.keys().copied().reduce(TransactionId::oldest)
    }

    /// Point-in-time snapshot with the given high-water mark.
    pub fn snapshot(&self, xmax: TransactionId) -> BootstrapSnapshot {
        let mut xip: Vec<_> = self.ids.keys().copied().collect();
        sort_circular(&mut xip);
        BootstrapSnapshot {
            xmin: xip.first().copied().unwrap_or(xmax),
            xmax,
            xip,
        }
    }

    /// Outstanding entries sorted oldest-first.
    pub fn entries(&self) -> Vec<(TransactionId, Holder)> {
        let mut ids: Vec<_> = self.ids.keys().copied().collect();
        sort_circular(&mut ids);
        ids.into_iter().map(|id| (id, self.ids[&id])).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid(raw: u32) -> TransactionId {
        TransactionId::from_raw(raw)
    }

    #[test]
    fn finish_unknown_id_is_stale() {
        let mut set = OutstandingSet::new();
        assert!(set.insert(xid(10), 1));
        assert!(!set.insert(xid(10), 1));

        assert_eq!(set.finish(xid(10)).map(|h| h.owner), Ok(1));
        assert_eq!(
            set.finish(xid(10)),
            Err(Error::StaleCompletion { xid: xid(10) })
        );
    }

    #[test]
    fn snapshot_is_sorted_with_oldest_as_xmin() {
        let mut set = OutstandingSet::new();
        for raw in [u32::MAX, 3, 1] {
            set.insert(xid(raw), 0);
        }
        let snap = set.snapshot(xid(4));
        assert_eq!(snap.xmin, xid(u32::MAX));
        assert_eq!(snap.xmax, xid(4));
        assert_eq!(snap.xip, vec![xid(u32::MAX), xid(1), xid(3)]);

        let empty = OutstandingSet::new().snapshot(xid(9));
        assert_eq!(empty.xmin, xid(9));
        assert!(empty.xip.is_empty());
    }
}
