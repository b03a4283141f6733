use crate::{Result, TransactionId};
use core::future::Future;

/// Where a sequencer gets its ids from and reports finishes to.
///
/// The authority runs its sequencer over a [`crate::LocalLedger`]; every other
/// node runs one over a connection to the authority. Implementations are
/// cheap handles that are cloned into background tasks, so none of these calls
/// ever run on the sequencer loop itself.
pub trait Upstream: Clone + Send + Sync + 'static {
    /// Returns `true` while the upstream can serve requests.
    fn is_ready(&self) -> bool;

    /// Incremented whenever the upstream may have lost state we depend on,
    /// such as a reconnect to the authority. Ids obtained under an older
    /// generation are discarded.
    fn generation(&self) -> u64;

    /// Requests up to `count` fresh ids.
    fn request_batch(
        &self,
        count: usize,
    ) -> impl Future<Output = Result<Vec<TransactionId>>> + Send;

    /// Requests exactly one fresh id.
    fn request_one(&self) -> impl Future<Output = Result<TransactionId>> + Send;

    /// Reports that `id` finished.
    fn finish(&self, id: TransactionId, committed: bool) -> impl Future<Output = Result<()>> + Send;
}
