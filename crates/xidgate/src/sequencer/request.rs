use crate::{
    BootstrapSnapshot, ClusterStatus, FinishOutcome, NodeId, RequestToken, Result, SequencerDump,
    TransactionId,
};
use tokio::sync::oneshot;

/// Messages accepted by the sequencer loop through its request mailbox.
///
/// Requests that callers may abandon carry a token into one of the handle's
/// pending tables instead of a reply channel, so the loop can tell an
/// abandoned request apart from a live one.
pub(crate) enum Request {
    Allocate {
        token: RequestToken,
        owner: NodeId,
    },
    Grant {
        token: RequestToken,
        owner: NodeId,
        count: usize,
    },
    Finish {
        token: RequestToken,
        id: TransactionId,
        committed: bool,
    },
    Snapshot(oneshot::Sender<BootstrapSnapshot>),
    Status(oneshot::Sender<ClusterStatus>),
    Dump(oneshot::Sender<SequencerDump>),
    OwnedBy(NodeId, oneshot::Sender<Vec<TransactionId>>),
    SetLocked(bool, oneshot::Sender<()>),
}

/// Upstream replies fed back into the loop from background tasks.
pub(crate) enum Internal {
    BatchArrived {
        generation: u64,
        result: Result<Vec<TransactionId>>,
    },
    SingleArrived {
        generation: u64,
        token: RequestToken,
        owner: NodeId,
        result: Result<TransactionId>,
    },
    FinishAcked {
        token: RequestToken,
        id: TransactionId,
        /// Whether the id was outstanding here when the finish arrived.
        known: bool,
        result: Result<()>,
    },
}

/// A request waiting for the pool to refill or the cluster to unlock.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Parked {
    Single { token: RequestToken, owner: NodeId },
    Batch { token: RequestToken, owner: NodeId, count: usize },
}

impl Parked {
    pub(crate) const fn demand(&self) -> usize {
        match self {
            Self::Single { .. } => 1,
            Self::Batch { count, .. } => *count,
        }
    }
}
