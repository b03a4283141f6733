//! Control-plane link from a node's sequencer to the authority.
//!
//! [`RemoteUpstream`] owns one background task that keeps a TCP connection to
//! the authority open, reconnecting at a fixed interval. Requests are written
//! through an outbound channel and matched back to their callers:
//!
//! - `p` batch requests are answered by `q` in the order they were sent, so
//!   their waiters live in a FIFO queue.
//! - `g` single requests and `f` finishes share one token-keyed
//!   [`PendingTable`], so a token is never reused across the two.
//!
//! On connect the node announces itself with a `p` frame for zero ids, which
//! the authority does not answer. Every (re)connect bumps
//! [`Upstream::generation`] before the link reports ready, which makes the
//! local sequencer discard bookkeeping from the previous link. Ids granted to
//! a caller that already gave up are sent back as abort finishes so the
//! authority does not hold them forever.

use crate::ClientConfig;
use core::future::Future;
use core::time::Duration;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, timeout, timeout_at},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use xidgate::{Error, NodeId, PendingTable, RequestToken, Result, TransactionId, Upstream};
use xidgate_proto::{ControlCodec, ControlFrame, ProtocolError};

/// Token used for finishes nobody waits on.
const UNTRACKED: RequestToken = 0;

/// Missed heartbeat intervals before the link is declared dead.
const SILENCE_LIMIT: u32 = 3;

/// Replies matched by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlReply {
    Single(TransactionId),
    Finished,
}

type BatchWaiter = oneshot::Sender<Result<Vec<TransactionId>>>;

struct Shared {
    node_id: NodeId,
    addr: String,
    request_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,
    connect_timeout: Duration,
    ready: watch::Sender<bool>,
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<ControlFrame>>>,
    replies: Arc<PendingTable<ControlReply>>,
    batches: Mutex<VecDeque<BatchWaiter>>,
    shutdown: CancellationToken,
}

/// [`Upstream`] backed by a connection to the authority.
#[derive(Clone)]
pub struct RemoteUpstream {
    shared: Arc<Shared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RemoteUpstream {
    /// Starts the connection manager on the current Tokio runtime. The
    /// upstream reports not-ready until the first connection is established.
    pub fn connect(config: &ClientConfig) -> Self {
        let (ready, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            node_id: config.node_id,
            addr: config.authority_addr.clone(),
            request_timeout: config.request_timeout,
            heartbeat_interval: config.heartbeat_interval,
            reconnect_interval: config.reconnect_interval,
            connect_timeout: config.connect_timeout,
            ready,
            generation: AtomicU64::new(0),
            outbound: Mutex::new(None),
            replies: Arc::new(PendingTable::new()),
            batches: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        });
        let task = tokio::spawn(Arc::clone(&shared).run());
        Self {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    /// Waits until the link is streaming-ready.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the link is not ready within `limit`, or
    /// [`Error::ServiceShutdown`] if the upstream was shut down.
    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        let mut rx = self.shared.ready.subscribe();
        match timeout(limit, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::ServiceShutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Closes the link and stops reconnecting. Pending requests fail with
    /// [`Error::UpstreamUnavailable`].
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Upstream connection task panicked: {e}");
            }
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        let mut attempt: u64 = 0;
        let mut connected_before = false;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            attempt += 1;
            match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed: {e}");
                    }
                    if connected_before {
                        tracing::info!(addr = %self.addr, attempt, "Reconnected to authority");
                    } else {
                        tracing::info!(addr = %self.addr, attempt, "Connected to authority");
                    }
                    connected_before = true;
                    attempt = 0;
                    match self.serve(stream).await {
                        Ok(()) => tracing::info!(addr = %self.addr, "Authority link closed"),
                        Err(e) => tracing::warn!(addr = %self.addr, "Authority link lost: {e}"),
                    }
                    self.disconnect();
                }
                Ok(Err(e)) => {
                    tracing::warn!(addr = %self.addr, attempt, "Connect to authority failed: {e}");
                }
                Err(_) => {
                    tracing::warn!(addr = %self.addr, attempt, "Connect to authority timed out");
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
        self.disconnect();
        self.ready.send_replace(false);
    }

    async fn serve(&self, stream: TcpStream) -> Result<()> {
        let (mut sink, mut frames) = Framed::new(stream, ControlCodec).split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Announces this node so single grants are recorded under its id.
        sink.send(ControlFrame::BatchRequest {
            node: self.node_id,
            count: 0,
        })
        .await?;

        *self.outbound.lock() = Some(tx);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.ready.send_replace(true);
        tracing::debug!(generation, "Authority link ready");

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let silence_limit = self.heartbeat_interval * SILENCE_LIMIT;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return Ok(()),

                Some(frame) = rx.recv() => {
                    sink.send(frame).await?;
                }

                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        last_heard = Instant::now();
                        self.dispatch(frame)?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ProtocolError::ConnectionClosed.into()),
                },

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() > silence_limit {
                        return Err(Error::upstream(format!(
                            "authority silent for {:?}",
                            last_heard.elapsed()
                        )));
                    }
                    sink.send(ControlFrame::Heartbeat).await?;
                }
            }
        }
    }

    fn dispatch(&self, frame: ControlFrame) -> core::result::Result<(), ProtocolError> {
        match frame {
            ControlFrame::BatchGrant { ids } => {
                let waiter = self.batches.lock().pop_front();
                let Some(waiter) = waiter else {
                    tracing::warn!(count = ids.len(), "Unsolicited batch grant");
                    self.release(ids);
                    return Ok(());
                };
                let result = if ids.is_empty() {
                    Err(Error::upstream("authority refused the batch"))
                } else {
                    Ok(ids)
                };
                if let Err(Ok(ids)) = waiter.send(result) {
                    tracing::debug!(count = ids.len(), "Batch arrived after its request gave up");
                    self.release(ids);
                }
            }
            ControlFrame::SingleGrant { token, xid } => {
                if let Some(Ok(_)) = self.replies.complete(token, Ok(ControlReply::Single(xid))) {
                    tracing::debug!(%xid, token, "Single grant arrived after its request gave up");
                    self.release(vec![xid]);
                }
            }
            ControlFrame::FinishAck { token, xid } => {
                if self
                    .replies
                    .complete(token, Ok(ControlReply::Finished))
                    .is_some()
                {
                    tracing::trace!(%xid, token, "Finish ack with no waiter");
                }
            }
            ControlFrame::Reject { token, code } => {
                tracing::debug!(token, ?code, "Authority rejected request");
                self.replies.complete(token, Err(code.into_error()));
            }
            ControlFrame::Heartbeat => {}
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "authority reply",
                    got: format!("{other:?}"),
                });
            }
        }
        Ok(())
    }

    /// Hands ids nobody will use back to the authority.
    fn release(&self, ids: Vec<TransactionId>) {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return;
        };
        for xid in ids {
            let _ = tx.send(ControlFrame::Finish {
                token: UNTRACKED,
                xid,
                committed: false,
            });
        }
    }

    fn disconnect(&self) {
        let dropped = self.outbound.lock().take();
        if dropped.is_none() {
            return;
        }
        self.ready.send_replace(false);

        let err = Error::upstream("authority link dropped");
        let batches: Vec<_> = self.batches.lock().drain(..).collect();
        let mut failed = batches
            .into_iter()
            .filter_map(|waiter| waiter.send(Err(err.clone())).ok())
            .count();
        failed += self.replies.fail_all(&err);
        if failed > 0 {
            tracing::warn!(failed, "Failed in-flight requests after link loss");
        }
    }

    /// Sends `frame` on the current link, running `link` first under the same
    /// lock so waiters are registered in send order.
    fn send_linked(&self, frame: ControlFrame, link: impl FnOnce()) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::upstream("not connected to authority"));
        };
        link();
        tx.send(frame)
            .map_err(|_| Error::upstream("authority link dropped"))
    }

    async fn round_trip(
        &self,
        frame: impl FnOnce(RequestToken) -> ControlFrame,
    ) -> Result<ControlReply> {
        let (guard, rx) = self.replies.register();
        self.send_linked(frame(guard.token()), || {})?;
        let deadline = Instant::now() + self.request_timeout;
        match timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::upstream("authority link dropped")),
            Err(_) => Err(Error::Timeout),
        }
    }
}

fn mismatched(reply: ControlReply) -> Error {
    Error::Protocol {
        reason: format!("mismatched reply {reply:?}"),
    }
}

impl Upstream for RemoteUpstream {
    fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    fn request_batch(
        &self,
        count: usize,
    ) -> impl Future<Output = Result<Vec<TransactionId>>> + Send {
        let shared = Arc::clone(&self.shared);
        async move {
            let (tx, rx) = oneshot::channel();
            let frame = ControlFrame::BatchRequest {
                node: shared.node_id,
                count: u32::try_from(count.max(1)).unwrap_or(u32::MAX),
            };
            shared.send_linked(frame, || shared.batches.lock().push_back(tx))?;
            match timeout(shared.request_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::upstream("authority link dropped")),
                Err(_) => Err(Error::Timeout),
            }
        }
    }

    fn request_one(&self) -> impl Future<Output = Result<TransactionId>> + Send {
        let shared = Arc::clone(&self.shared);
        async move {
            match shared
                .round_trip(|token| ControlFrame::SingleRequest { token })
                .await?
            {
                ControlReply::Single(xid) => Ok(xid),
                other => Err(mismatched(other)),
            }
        }
    }

    fn finish(
        &self,
        id: TransactionId,
        committed: bool,
    ) -> impl Future<Output = Result<()>> + Send {
        let shared = Arc::clone(&self.shared);
        async move {
            match shared
                .round_trip(|token| ControlFrame::Finish {
                    token,
                    xid: id,
                    committed,
                })
                .await?
            {
                ControlReply::Finished => Ok(()),
                other => Err(mismatched(other)),
            }
        }
    }
}

impl core::fmt::Debug for RemoteUpstream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteUpstream")
            .field("addr", &self.shared.addr)
            .field("node_id", &self.shared.node_id)
            .field("ready", &self.is_ready())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type AuthorityEnd = Framed<TcpStream, ControlCodec>;

    async fn pair() -> (RemoteUpstream, TcpListener, AuthorityEnd) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = ClientConfig::new(addr, 7)
            .with_request_timeout(Duration::from_millis(500))
            .with_heartbeat_interval(Duration::from_secs(60))
            .with_reconnect_interval(Duration::from_millis(20));
        let upstream = RemoteUpstream::connect(&config);
        let (socket, _) = listener.accept().await.unwrap();
        upstream.wait_ready(Duration::from_secs(2)).await.unwrap();
        (upstream, listener, Framed::new(socket, ControlCodec))
    }

    /// Reads the next frame from the node, skipping heartbeats and the
    /// connect-time announcement.
    async fn next_request(authority: &mut AuthorityEnd) -> ControlFrame {
        loop {
            match authority.next().await.unwrap().unwrap() {
                ControlFrame::Heartbeat | ControlFrame::BatchRequest { count: 0, .. } => continue,
                frame => return frame,
            }
        }
    }

    fn xid(raw: u32) -> TransactionId {
        TransactionId::from_raw(raw)
    }

    #[tokio::test]
    async fn batch_single_and_finish_round_trip() {
        let (upstream, _listener, mut authority) = pair().await;
        assert!(upstream.is_ready());
        assert_eq!(upstream.generation(), 1);

        let batch = tokio::spawn({
            let upstream = upstream.clone();
            async move { upstream.request_batch(3).await }
        });
        assert_eq!(
            next_request(&mut authority).await,
            ControlFrame::BatchRequest { node: 7, count: 3 }
        );
        let ids = vec![xid(1), xid(2), xid(3)];
        authority
            .send(ControlFrame::BatchGrant { ids: ids.clone() })
            .await
            .unwrap();
        assert_eq!(batch.await.unwrap(), Ok(ids));

        let single = tokio::spawn({
            let upstream = upstream.clone();
            async move { upstream.request_one().await }
        });
        let ControlFrame::SingleRequest { token } = next_request(&mut authority).await else {
            panic!("expected a single request");
        };
        authority
            .send(ControlFrame::SingleGrant { token, xid: xid(4) })
            .await
            .unwrap();
        assert_eq!(single.await.unwrap(), Ok(xid(4)));

        let finish = tokio::spawn({
            let upstream = upstream.clone();
            async move { upstream.finish(xid(2), true).await }
        });
        let ControlFrame::Finish {
            token,
            xid: finished,
            committed,
        } = next_request(&mut authority).await
        else {
            panic!("expected a finish");
        };
        assert_eq!((finished, committed), (xid(2), true));
        authority
            .send(ControlFrame::FinishAck { token, xid: finished })
            .await
            .unwrap();
        assert_eq!(finish.await.unwrap(), Ok(()));

        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn empty_grant_and_reject_surface_as_errors() {
        let (upstream, _listener, mut authority) = pair().await;

        let batch = tokio::spawn({
            let upstream = upstream.clone();
            async move { upstream.request_batch(5).await }
        });
        next_request(&mut authority).await;
        authority
            .send(ControlFrame::BatchGrant { ids: Vec::new() })
            .await
            .unwrap();
        assert!(matches!(
            batch.await.unwrap(),
            Err(Error::UpstreamUnavailable { .. })
        ));

        let single = tokio::spawn({
            let upstream = upstream.clone();
            async move { upstream.request_one().await }
        });
        let ControlFrame::SingleRequest { token } = next_request(&mut authority).await else {
            panic!("expected a single request");
        };
        authority
            .send(ControlFrame::Reject {
                token,
                code: xidgate_proto::ErrorCode::ServiceShutdown,
            })
            .await
            .unwrap();
        assert_eq!(single.await.unwrap(), Err(Error::ServiceShutdown));

        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_link_fails_in_flight_requests_and_reconnects() {
        let (upstream, listener, mut authority) = pair().await;

        let mut waiting = Vec::new();
        for _ in 0..3 {
            let upstream = upstream.clone();
            waiting.push(tokio::spawn(async move { upstream.request_one().await }));
        }
        for _ in 0..3 {
            next_request(&mut authority).await;
        }
        drop(authority);

        for task in waiting {
            assert!(matches!(
                task.await.unwrap(),
                Err(Error::UpstreamUnavailable { .. })
            ));
        }

        let (_socket, _) = listener.accept().await.unwrap();
        upstream.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(upstream.generation(), 2);

        upstream.shutdown().await;
        assert!(!upstream.is_ready());
    }

    #[tokio::test]
    async fn late_single_grant_is_released() {
        let (upstream, _listener, mut authority) = pair().await;

        let result = upstream.request_one().await;
        assert_eq!(result, Err(Error::Timeout));
        let ControlFrame::SingleRequest { token } = next_request(&mut authority).await else {
            panic!("expected a single request");
        };

        authority
            .send(ControlFrame::SingleGrant { token, xid: xid(9) })
            .await
            .unwrap();
        assert_eq!(
            next_request(&mut authority).await,
            ControlFrame::Finish {
                token: UNTRACKED,
                xid: xid(9),
                committed: false,
            }
        );

        upstream.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_frame_drops_the_link() {
        let (upstream, listener, mut authority) = pair().await;
        authority
            .send(ControlFrame::SingleRequest { token: 1 })
            .await
            .unwrap();

        let (_socket, _) = listener.accept().await.unwrap();
        upstream.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(upstream.generation(), 2);

        upstream.shutdown().await;
    }
}
