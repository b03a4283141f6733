use crate::{TransactionId, xid::sort_circular};
use core::fmt;
use std::collections::HashSet;

/// A point-in-time view of in-flight transactions.
///
/// - `xmin`: the oldest id still running, or `xmax` when nothing is.
/// - `xmax`: the first id that had not been issued when the snapshot was
///   taken. Every id at or after `xmax` is invisible.
/// - `xip`: running ids, sorted oldest-first under circular ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootstrapSnapshot {
    pub xmin: TransactionId,
    pub xmax: TransactionId,
    pub xip: Vec<TransactionId>,
}

impl BootstrapSnapshot {
    /// A snapshot of a cluster that has issued nothing yet.
    pub fn empty(xmax: TransactionId) -> Self {
        Self {
            xmin: xmax,
            xmax,
            xip: Vec::new(),
        }
    }

    pub fn is_running(&self, id: TransactionId) -> bool {
        self.xip.contains(&id)
    }
}

impl fmt::Display for BootstrapSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.xmin, self.xmax)?;
        for (i, id) in self.xip.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

/// An incremental change to the set of running transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SnapshotDelta {
    /// Newly issued ids.
    Assign(Vec<TransactionId>),
    /// Newly finished ids, committed or aborted.
    Commit(Vec<TransactionId>),
}

impl SnapshotDelta {
    pub fn ids(&self) -> &[TransactionId] {
        match self {
            Self::Assign(ids) | Self::Commit(ids) => ids,
        }
    }

    pub const fn is_assign(&self) -> bool {
        matches!(self, Self::Assign(_))
    }
}

/// What the sequencer hands to a snapshot sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEvent {
    /// The full running set. Sent when a sink is attached and whenever the
    /// sequencer discards its bookkeeping.
    Reset(BootstrapSnapshot),
    Delta(SnapshotDelta),
}

/// A mirror of the running set rebuilt from a bootstrap plus deltas.
///
/// The broadcaster keeps one to answer bootstrap requests from the same loop
/// that fans deltas out, and every subscriber keeps one as its local
/// visibility state.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    running: HashSet<TransactionId>,
    xmax: TransactionId,
}

impl Default for SnapshotView {
    fn default() -> Self {
        Self::new(TransactionId::FIRST)
    }
}

impl SnapshotView {
    /// An empty view whose next unissued id is `xmax`.
    pub fn new(xmax: TransactionId) -> Self {
        Self {
            running: HashSet::new(),
            xmax,
        }
    }

    pub fn from_bootstrap(snapshot: &BootstrapSnapshot) -> Self {
        let mut view = Self::new(snapshot.xmax);
        view.reset(snapshot);
        view
    }

    /// Replaces the view with `snapshot`.
    pub fn reset(&mut self, snapshot: &BootstrapSnapshot) {
        self.running.clear();
        self.running.extend(snapshot.xip.iter().copied());
        self.xmax = snapshot.xmax;
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub const fn xmax(&self) -> TransactionId {
        self.xmax
    }

    /// Records newly issued ids. Returns the ids that were already running.
    pub fn apply_assign(&mut self, ids: &[TransactionId]) -> Vec<TransactionId> {
        let mut duplicates = Vec::new();
        for &id in ids {
            if !self.running.insert(id) {
                duplicates.push(id);
            }
            let after = id.next();
            if after.follows(self.xmax) {
                self.xmax = after;
            }
        }
        duplicates
    }

    /// Records finished ids. Returns the ids that were not running.
    pub fn apply_commit(&mut self, ids: &[TransactionId]) -> Vec<TransactionId> {
        ids.iter()
            .copied()
            .filter(|id| !self.running.remove(id))
            .collect()
    }

    /// Applies `delta`, returning the ids that did not fit the current view.
    pub fn apply(&mut self, delta: &SnapshotDelta) -> Vec<TransactionId> {
        match delta {
            SnapshotDelta::Assign(ids) => self.apply_assign(ids),
            SnapshotDelta::Commit(ids) => self.apply_commit(ids),
        }
    }

    pub fn is_running(&self, id: TransactionId) -> bool {
        self.running.contains(&id)
    }

    /// Returns `true` if `id` had finished as of this view: it was issued
    /// before `xmax` and is no longer running.
    pub fn is_visible(&self, id: TransactionId) -> bool {
        id.is_valid() && id.precedes(self.xmax) && !self.is_running(id)
    }

    /// Copies the view into a sorted snapshot.
    pub fn bootstrap(&self) -> BootstrapSnapshot {
        let mut xip: Vec<_> = self.running.iter().copied().collect();
        sort_circular(&mut xip);
        BootstrapSnapshot {
            xmin: xip.first().copied().unwrap_or(self.xmax),
            xmax: self.xmax,
            xip,
        }
    }
}
