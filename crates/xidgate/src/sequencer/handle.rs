use crate::{
    BootstrapSnapshot, BoundedMailbox, ClusterStatus, Error, FinishOutcome, NodeId, PendingTable,
    Result, SequencerConfig, SequencerDump, SnapshotEvent, TransactionId, Upstream,
    sequencer::{request::Request, service::SequencerLoop},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;

/// Handle to a running sequencer loop.
///
/// The loop exclusively owns the pre-allocation pool and the outstanding set.
/// Handles are cheap to clone and only talk to the loop through its bounded
/// request mailbox, so a full mailbox makes callers wait (up to their
/// deadline) rather than grow memory.
///
/// # Example
///
/// ```
/// use tokio::time::{Duration, Instant};
/// use xidgate::{IdentitySequencer, LocalLedger, SequencerConfig, FinishOutcome};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> xidgate::Result<()> {
/// let sequencer = IdentitySequencer::spawn(LocalLedger::default(), SequencerConfig::default());
/// let deadline = Instant::now() + Duration::from_secs(1);
///
/// let xid = sequencer.allocate(deadline).await?;
/// assert!(xid.is_valid());
/// assert_eq!(sequencer.finish(xid, true, deadline).await?, FinishOutcome::Finished);
/// assert_eq!(sequencer.finish(xid, true, deadline).await?, FinishOutcome::Stale);
///
/// sequencer.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct IdentitySequencer {
    requests: Arc<BoundedMailbox<Request>>,
    singles: Arc<PendingTable<TransactionId>>,
    grants: Arc<PendingTable<Vec<TransactionId>>>,
    finishes: Arc<PendingTable<FinishOutcome>>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    node_id: NodeId,
    request_timeout: Duration,
}

impl IdentitySequencer {
    /// Starts a sequencer loop over `upstream` on the current Tokio runtime.
    pub fn spawn<U: Upstream>(upstream: U, config: SequencerConfig) -> Self {
        Self::start(upstream, config, None)
    }

    /// Like [`Self::spawn`], additionally pushing every assign and finish into
    /// `events`.
    ///
    /// A [`SnapshotEvent::Reset`] carrying the current running set is pushed
    /// first. The loop waits for room in `events` rather than dropping an
    /// event.
    pub fn spawn_with_events<U: Upstream>(
        upstream: U,
        config: SequencerConfig,
        events: Arc<BoundedMailbox<SnapshotEvent>>,
    ) -> Self {
        Self::start(upstream, config, Some(events))
    }

    fn start<U: Upstream>(
        upstream: U,
        config: SequencerConfig,
        events: Option<Arc<BoundedMailbox<SnapshotEvent>>>,
    ) -> Self {
        let requests = Arc::new(BoundedMailbox::new(config.mailbox_capacity));
        let singles = Arc::new(PendingTable::new());
        let grants = Arc::new(PendingTable::new());
        let finishes = Arc::new(PendingTable::new());
        let shutdown = CancellationToken::new();
        let node_id = config.node_id;
        let request_timeout = config.request_timeout;

        let service = SequencerLoop::new(
            upstream,
            config,
            Arc::clone(&requests),
            Arc::clone(&singles),
            Arc::clone(&grants),
            Arc::clone(&finishes),
            events,
            shutdown.clone(),
        );
        let task = tokio::spawn(service.run());

        Self {
            requests,
            singles,
            grants,
            finishes,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
            node_id,
            request_timeout,
        }
    }

    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Default deadline used by requests that do not take one explicitly.
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Allocates one id owned by this node.
    ///
    /// # Errors
    ///
    /// - [`Error::UpstreamUnavailable`] if the upstream is not ready.
    /// - [`Error::Timeout`] if `deadline` passes first. The request is
    ///   unlinked before this returns; an id granted afterwards goes back to
    ///   the pool.
    /// - [`Error::ServiceShutdown`] if the sequencer is stopping.
    pub async fn allocate(&self, deadline: Instant) -> Result<TransactionId> {
        self.allocate_for(self.node_id, deadline).await
    }

    /// Allocates one id on behalf of `owner`.
    ///
    /// # Errors
    ///
    /// See [`Self::allocate`].
    pub async fn allocate_for(&self, owner: NodeId, deadline: Instant) -> Result<TransactionId> {
        let (guard, rx) = self.singles.register();
        self.submit(
            Request::Allocate {
                token: guard.token(),
                owner,
            },
            deadline,
        )
        .await?;
        wait(rx, deadline).await
    }

    /// Grants up to `count` ids to `owner` in one step.
    ///
    /// Every granted id is recorded as outstanding for `owner` and announced
    /// as a single assign batch. Waits for a replenishment if the pool is
    /// empty, then returns whatever the pool holds up to `count`.
    ///
    /// # Errors
    ///
    /// See [`Self::allocate`].
    pub async fn grant_batch(
        &self,
        owner: NodeId,
        count: usize,
        deadline: Instant,
    ) -> Result<Vec<TransactionId>> {
        let (guard, rx) = self.grants.register();
        self.submit(
            Request::Grant {
                token: guard.token(),
                owner,
                count: count.max(1),
            },
            deadline,
        )
        .await?;
        wait(rx, deadline).await
    }

    /// Reports that `id` finished.
    ///
    /// Finishing an id that is not outstanding is not an error and resolves to
    /// [`FinishOutcome::Stale`].
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`]. Callers that must not
    /// fail a finish should map these to [`FinishOutcome::Degraded`].
    pub async fn finish(
        &self,
        id: TransactionId,
        committed: bool,
        deadline: Instant,
    ) -> Result<FinishOutcome> {
        let (guard, rx) = self.finishes.register();
        self.submit(
            Request::Finish {
                token: guard.token(),
                id,
                committed,
            },
            deadline,
        )
        .await?;
        wait(rx, deadline).await
    }

    /// A point-in-time copy of the outstanding set.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`].
    pub async fn snapshot(&self) -> Result<BootstrapSnapshot> {
        self.query(Request::Snapshot).await
    }

    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`].
    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        self.query(Request::Status).await
    }

    /// Copies the pool and outstanding set for operator inspection.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`].
    pub async fn dump(&self) -> Result<SequencerDump> {
        self.query(Request::Dump).await
    }

    /// Outstanding ids currently owned by `owner`.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`].
    pub async fn owned_by(&self, owner: NodeId) -> Result<Vec<TransactionId>> {
        self.query(|tx| Request::OwnedBy(owner, tx)).await
    }

    /// Parks new allocations and grants until [`Self::unlock_cluster`].
    /// Finishes keep flowing.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`].
    pub async fn lock_cluster(&self) -> Result<()> {
        self.query(|tx| Request::SetLocked(true, tx)).await
    }

    /// Releases a [`Self::lock_cluster`] and serves parked requests in order.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] or [`Error::ServiceShutdown`].
    pub async fn unlock_cluster(&self) -> Result<()> {
        self.query(|tx| Request::SetLocked(false, tx)).await
    }

    /// Stops the loop and waits for it to exit. Parked and queued requests
    /// fail with [`Error::ServiceShutdown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Sequencer loop panicked: {e}");
            }
        }
    }

    async fn submit(&self, request: Request, deadline: Instant) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        self.requests
            .push_until(request, deadline)
            .await
            .map_err(|e| e.into_error(self.requests.capacity()))
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let deadline = Instant::now() + self.request_timeout;
        let (tx, rx) = oneshot::channel();
        self.submit(make(tx), deadline).await?;
        match timeout_at(deadline, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::ServiceShutdown),
            Err(_) => Err(Error::Timeout),
        }
    }
}

async fn wait<T>(rx: oneshot::Receiver<Result<T>>, deadline: Instant) -> Result<T> {
    match timeout_at(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::ServiceShutdown),
        Err(_) => Err(Error::Timeout),
    }
}

impl core::fmt::Debug for IdentitySequencer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentitySequencer")
            .field("node_id", &self.node_id)
            .field("requests", &self.requests)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
