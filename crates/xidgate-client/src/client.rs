use crate::{ClientConfig, RemoteUpstream};
use core::time::Duration;
use tokio::time::Instant;
use xidgate::{
    ClusterStatus, FinishOutcome, IdentitySequencer, Result, SequencerDump, TransactionId,
};

/// Transaction id service for a non-authority node.
///
/// Wraps a local [`IdentitySequencer`] whose pool is filled from the
/// authority over a [`RemoteUpstream`]. Local callers only ever see two
/// operations: [`Self::request_xid`], whose failure must abort the caller's
/// transaction, and [`Self::finish_xid`], which never fails.
#[derive(Clone, Debug)]
pub struct SequencerClient {
    sequencer: IdentitySequencer,
    upstream: RemoteUpstream,
    request_timeout: Duration,
}

impl SequencerClient {
    /// Starts the authority link and the local sequencer on the current
    /// Tokio runtime.
    pub fn connect(config: ClientConfig) -> Self {
        let upstream = RemoteUpstream::connect(&config);
        let sequencer = IdentitySequencer::spawn(upstream.clone(), config.sequencer_config());
        Self {
            sequencer,
            upstream,
            request_timeout: config.request_timeout,
        }
    }

    /// Waits until the authority link is ready.
    ///
    /// # Errors
    ///
    /// [`xidgate::Error::Timeout`] if it is not ready within `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        self.upstream.wait_ready(limit).await
    }

    /// Returns a fresh id, recorded locally as outstanding.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the caller's transaction:
    /// [`xidgate::Error::UpstreamUnavailable`] when the authority link is
    /// down, [`xidgate::Error::Timeout`] when `deadline` passes first.
    pub async fn request_xid(&self, deadline: Instant) -> Result<TransactionId> {
        self.sequencer.allocate(deadline).await
    }

    /// Reports that `id` finished. Returns within the request timeout no
    /// matter what state the authority link is in.
    pub async fn finish_xid(&self, id: TransactionId, committed: bool) -> FinishOutcome {
        let deadline = Instant::now() + self.request_timeout;
        match self.sequencer.finish(id, committed, deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(%id, committed, "Finish degraded: {e}");
                FinishOutcome::Degraded
            }
        }
    }

    /// Starts an [`XidLease`] in the `Idle` state.
    pub fn begin(&self) -> XidLease {
        XidLease {
            client: self.clone(),
            state: LeaseState::Idle,
        }
    }

    /// # Errors
    ///
    /// [`xidgate::Error::Timeout`] or [`xidgate::Error::ServiceShutdown`].
    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        self.sequencer.cluster_status().await
    }

    /// # Errors
    ///
    /// [`xidgate::Error::Timeout`] or [`xidgate::Error::ServiceShutdown`].
    pub async fn dump(&self) -> Result<SequencerDump> {
        self.sequencer.dump().await
    }

    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Stops the local sequencer, then the authority link.
    pub async fn shutdown(&self) {
        self.sequencer.shutdown().await;
        self.upstream.shutdown().await;
    }
}

/// Where a [`XidLease`] is in its transaction's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    Requesting,
    Holding(TransactionId),
    Committing(TransactionId),
}

/// One logical transaction's hold on an id.
///
/// Moves `Idle -> Requesting -> Holding -> Committing -> Idle`, falling back
/// to `Idle` when a request fails. Dropping a lease that still holds an id
/// sends a best-effort abort finish.
#[derive(Debug)]
pub struct XidLease {
    client: SequencerClient,
    state: LeaseState,
}

impl XidLease {
    pub const fn state(&self) -> LeaseState {
        self.state
    }

    /// The held id, if any.
    pub const fn xid(&self) -> Option<TransactionId> {
        match self.state {
            LeaseState::Holding(id) | LeaseState::Committing(id) => Some(id),
            LeaseState::Idle | LeaseState::Requesting => None,
        }
    }

    /// Requests an id, or returns the one already held.
    ///
    /// # Errors
    ///
    /// See [`SequencerClient::request_xid`]. The lease is `Idle` afterwards.
    pub async fn acquire(&mut self, deadline: Instant) -> Result<TransactionId> {
        if let LeaseState::Holding(id) = self.state {
            return Ok(id);
        }
        self.state = LeaseState::Requesting;
        match self.client.request_xid(deadline).await {
            Ok(id) => {
                self.state = LeaseState::Holding(id);
                Ok(id)
            }
            Err(e) => {
                self.state = LeaseState::Idle;
                Err(e)
            }
        }
    }

    /// Finishes the held id as committed. Returns `None` if nothing is held.
    pub async fn commit(&mut self) -> Option<FinishOutcome> {
        self.finish(true).await
    }

    /// Finishes the held id as aborted. Returns `None` if nothing is held.
    pub async fn abort(&mut self) -> Option<FinishOutcome> {
        self.finish(false).await
    }

    async fn finish(&mut self, committed: bool) -> Option<FinishOutcome> {
        let LeaseState::Holding(id) = self.state else {
            return None;
        };
        self.state = LeaseState::Committing(id);
        let outcome = self.client.finish_xid(id, committed).await;
        self.state = LeaseState::Idle;
        Some(outcome)
    }
}

impl Drop for XidLease {
    fn drop(&mut self) {
        let Some(id) = self.xid() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%id, "Lease dropped outside a runtime; id stays outstanding");
            return;
        };
        let client = self.client.clone();
        runtime.spawn(async move {
            client.finish_xid(id, false).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use xidgate::{Error, LocalLedger, Upstream};
    use xidgate_proto::{ControlCodec, ControlFrame};

    /// A minimal authority answering every request from a [`LocalLedger`].
    async fn serve_authority(listener: TcpListener) {
        let ledger = LocalLedger::default();
        while let Ok((socket, _)) = listener.accept().await {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, ControlCodec);
                while let Some(Ok(frame)) = framed.next().await {
                    let reply = match frame {
                        ControlFrame::BatchRequest { count: 0, .. } => continue,
                        ControlFrame::BatchRequest { count, .. } => ControlFrame::BatchGrant {
                            ids: ledger.issue(count as usize),
                        },
                        ControlFrame::SingleRequest { token } => ControlFrame::SingleGrant {
                            token,
                            xid: ledger.request_one().await.unwrap(),
                        },
                        ControlFrame::Finish { token, xid, .. } => {
                            ControlFrame::FinishAck { token, xid }
                        }
                        _ => continue,
                    };
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    async fn client(pool_target: usize) -> SequencerClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_authority(listener));
        let config = ClientConfig::new(addr, 3)
            .with_pool_target(pool_target)
            .with_request_timeout(Duration::from_secs(2));
        let client = SequencerClient::connect(config);
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        client
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[tokio::test]
    async fn pooled_and_slow_path_both_issue_unique_ids() {
        for target in [0, 4] {
            let client = client(target).await;
            let mut seen = Vec::new();
            for _ in 0..10 {
                let id = client.request_xid(soon()).await.unwrap();
                assert!(id.is_valid());
                assert!(!seen.contains(&id));
                seen.push(id);
            }
            for id in seen {
                assert_eq!(client.finish_xid(id, true).await, FinishOutcome::Finished);
            }
            client.shutdown().await;
        }
    }

    #[tokio::test]
    async fn double_finish_is_stale() {
        let client = client(2).await;
        let id = client.request_xid(soon()).await.unwrap();
        assert_eq!(client.finish_xid(id, false).await, FinishOutcome::Finished);
        assert_eq!(client.finish_xid(id, false).await, FinishOutcome::Stale);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn lease_walks_its_states() {
        let client = client(2).await;
        let mut lease = client.begin();
        assert_eq!(lease.state(), LeaseState::Idle);
        assert_eq!(lease.commit().await, None);

        let id = lease.acquire(soon()).await.unwrap();
        assert_eq!(lease.state(), LeaseState::Holding(id));
        assert_eq!(lease.acquire(soon()).await.unwrap(), id);

        assert_eq!(lease.commit().await, Some(FinishOutcome::Finished));
        assert_eq!(lease.state(), LeaseState::Idle);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_lease_aborts_its_id() {
        let client = client(2).await;
        let mut lease = client.begin();
        let id = lease.acquire(soon()).await.unwrap();
        assert_eq!(client.dump().await.unwrap().outstanding.len(), 1);

        drop(lease);
        for _ in 0..100 {
            if client.dump().await.unwrap().outstanding.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.dump().await.unwrap().outstanding.is_empty());
        assert_eq!(client.finish_xid(id, true).await, FinishOutcome::Stale);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_authority_fails_fast_and_degrades_finish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ClientConfig::new(addr, 3).with_request_timeout(Duration::from_millis(200));
        let client = SequencerClient::connect(config);
        let mut lease = client.begin();
        let err = lease.acquire(soon()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable { .. }));
        assert_eq!(lease.state(), LeaseState::Idle);

        assert_eq!(
            client.finish_xid(TransactionId::from_raw(42), true).await,
            FinishOutcome::Stale
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn node_side_reconnect_resets_bookkeeping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = ClientConfig::new(addr, 3)
            .with_pool_target(0)
            .with_reconnect_interval(Duration::from_millis(20));
        let client = SequencerClient::connect(config);

        let (socket, _) = listener.accept().await.unwrap();
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        let mut authority = Framed::new(socket, ControlCodec);

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.request_xid(soon()).await }
        });
        let token = loop {
            let frame = authority.next().await.unwrap().unwrap();
            if let ControlFrame::SingleRequest { token } = frame {
                break token;
            }
        };
        authority
            .send(ControlFrame::SingleGrant {
                token,
                xid: TransactionId::from_raw(77),
            })
            .await
            .unwrap();
        let id = request.await.unwrap().unwrap();
        drop(authority);

        let (_socket, _) = listener.accept().await.unwrap();
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(client.upstream.generation(), 2);

        // Whatever the sequencer knew about the old link is gone.
        assert_eq!(client.finish_xid(id, true).await, FinishOutcome::Stale);
        client.shutdown().await;
    }
}
