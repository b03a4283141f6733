//! Cluster-wide transaction id sequencing.
//!
//! An [`IdentitySequencer`] owns a pre-allocation pool and the set of
//! outstanding ids, and answers allocate/finish requests through a bounded
//! [`BoundedMailbox`]. It pulls ids from an [`Upstream`]: a [`LocalLedger`] on
//! the authority node, or a connection to the authority everywhere else.
//! Assign and finish events can be streamed to a snapshot sink, which is how
//! the authority keeps subscribers' [`SnapshotView`]s in step with its own
//! outstanding set.

mod error;
mod mailbox;
mod outstanding;
mod pending;
mod pool;
mod sequencer;
mod snapshot;
mod status;
mod xid;

pub use crate::error::*;
pub use crate::mailbox::*;
pub use crate::outstanding::*;
pub use crate::pending::*;
pub use crate::pool::*;
pub use crate::sequencer::*;
pub use crate::snapshot::*;
pub use crate::status::*;
pub use crate::xid::*;
