//! One control-plane session per connected node.
//!
//! Batch grants are answered in request order, since `q` carries no token and
//! the node matches grants to requests first-in first-out. Single grants and
//! finish acknowledgements carry the node's token and are written as soon as
//! they resolve.

use crate::server::telemetry::{
    increment_stale_completions, increment_xids_finished, increment_xids_granted,
};
use core::time::Duration;
use futures::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{FuturesOrdered, FuturesUnordered},
};
use std::net::SocketAddr;
use tokio::{
    net::TcpStream,
    time::{Instant, MissedTickBehavior, timeout},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use xidgate::{FinishOutcome, IdentitySequencer, NodeId};
use xidgate_proto::{ControlCodec, ControlFrame, ErrorCode, ProtocolError};

/// Owner recorded for ids allocated before a node announced itself.
pub const UNANNOUNCED: NodeId = NodeId::MAX;

/// Heartbeat intervals of silence after which a node is dropped.
const SILENT_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Most ids granted for one `p` request.
    pub max_batch: usize,
}

/// Serves one node until it disconnects, misbehaves, goes silent, or
/// `shutdown` fires. Returns the node id it announced, if any.
///
/// # Errors
///
/// A [`ProtocolError`] for a malformed frame, an authority-bound frame type
/// arriving from the node, or a failed write.
pub async fn serve_node(
    socket: TcpStream,
    peer: SocketAddr,
    sequencer: IdentitySequencer,
    config: SessionConfig,
    shutdown: CancellationToken,
) -> Result<Option<NodeId>, ProtocolError> {
    let _ = socket.set_nodelay(true);
    let (mut sink, mut frames) = Framed::new(socket, ControlCodec).split();

    let mut node: Option<NodeId> = None;
    let mut grants: FuturesOrdered<BoxFuture<'static, ControlFrame>> = FuturesOrdered::new();
    let mut replies: FuturesUnordered<BoxFuture<'static, ControlFrame>> = FuturesUnordered::new();

    let mut tick = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();
    let silent_limit = config.heartbeat_interval * SILENT_INTERVALS;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(grant) = grants.next(), if !grants.is_empty() => sink.send(grant).await?,
            Some(reply) = replies.next(), if !replies.is_empty() => sink.send(reply).await?,
            frame = frames.next() => {
                let frame = match frame {
                    Some(frame) => frame?,
                    None => {
                        tracing::info!(%peer, node, "Node disconnected");
                        break;
                    }
                };
                last_heard = Instant::now();
                let owner = node.unwrap_or(UNANNOUNCED);
                let deadline = last_heard + config.request_timeout;
                let sequencer = sequencer.clone();

                match frame {
                    ControlFrame::BatchRequest { node: announced, count: 0 } => {
                        tracing::info!(%peer, node = announced, "Node announced");
                        node = Some(announced);
                    }
                    ControlFrame::BatchRequest { node: requester, count } => {
                        node.get_or_insert(requester);
                        let granted = (count as usize).min(config.max_batch);
                        if granted < count as usize {
                            tracing::debug!(
                                node = requester,
                                count,
                                granted,
                                "Clamped batch request"
                            );
                        }
                        grants.push_back(
                            async move {
                                match sequencer.grant_batch(requester, granted, deadline).await {
                                    Ok(ids) => {
                                        increment_xids_granted(ids.len() as u64);
                                        ControlFrame::BatchGrant { ids }
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            node = requester,
                                            granted,
                                            "Batch grant refused: {e}"
                                        );
                                        ControlFrame::BatchGrant { ids: Vec::new() }
                                    }
                                }
                            }
                            .boxed(),
                        );
                    }
                    ControlFrame::SingleRequest { token } => {
                        replies.push(
                            async move {
                                match sequencer.allocate_for(owner, deadline).await {
                                    Ok(xid) => {
                                        increment_xids_granted(1);
                                        ControlFrame::SingleGrant { token, xid }
                                    }
                                    Err(e) => ControlFrame::Reject {
                                        token,
                                        code: ErrorCode::from(&e),
                                    },
                                }
                            }
                            .boxed(),
                        );
                    }
                    ControlFrame::Finish { token, xid, committed } => {
                        replies.push(
                            async move {
                                match sequencer.finish(xid, committed, deadline).await {
                                    Ok(outcome) => {
                                        if outcome == FinishOutcome::Stale {
                                            increment_stale_completions();
                                        } else {
                                            increment_xids_finished();
                                        }
                                        ControlFrame::FinishAck { token, xid }
                                    }
                                    Err(e) => ControlFrame::Reject {
                                        token,
                                        code: ErrorCode::from(&e),
                                    },
                                }
                            }
                            .boxed(),
                        );
                    }
                    ControlFrame::Heartbeat => {}
                    other => {
                        return Err(ProtocolError::Unexpected {
                            expected: "node request",
                            got: format!("{other:?}"),
                        });
                    }
                }
            }
            _ = tick.tick() => {
                if last_heard.elapsed() > silent_limit {
                    tracing::warn!(
                        %peer,
                        node,
                        "Node silent for {silent_limit:?}, dropping session"
                    );
                    break;
                }
                sink.send(ControlFrame::Heartbeat).await?;
            }
        }
    }

    Ok(node)
}

/// Logs ids a departed node still holds. They stay outstanding, and show up
/// as leak candidates in the dump once they age past the threshold.
pub async fn report_orphans(sequencer: &IdentitySequencer, node: NodeId, limit: Duration) {
    match timeout(limit, sequencer.owned_by(node)).await {
        Ok(Ok(ids)) if ids.is_empty() => {}
        Ok(Ok(ids)) => {
            tracing::warn!(node, count = ids.len(), ?ids, "Node left ids outstanding");
        }
        Ok(Err(e)) => tracing::debug!(node, "Could not list orphaned ids: {e}"),
        Err(_) => tracing::debug!(node, "Timed out listing orphaned ids"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use xidgate::{LocalLedger, SequencerConfig, TransactionId};

    const MAX_BATCH: usize = 16;

    struct Fixture {
        sequencer: IdentitySequencer,
        addr: SocketAddr,
        results: tokio::sync::mpsc::UnboundedReceiver<Result<Option<NodeId>, ProtocolError>>,
    }

    async fn fixture(heartbeat_interval: Duration) -> Fixture {
        let sequencer = IdentitySequencer::spawn(
            LocalLedger::default(),
            SequencerConfig::default().with_pool_target(8),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, results) = tokio::sync::mpsc::unbounded_channel();
        let handle = sequencer.clone();
        tokio::spawn(async move {
            while let Ok((socket, peer)) = listener.accept().await {
                let config = SessionConfig {
                    request_timeout: Duration::from_secs(2),
                    heartbeat_interval,
                    max_batch: MAX_BATCH,
                };
                let result =
                    serve_node(socket, peer, handle.clone(), config, CancellationToken::new())
                        .await;
                let _ = tx.send(result);
            }
        });
        Fixture {
            sequencer,
            addr,
            results,
        }
    }

    async fn node(addr: SocketAddr, id: NodeId) -> Framed<TcpStream, ControlCodec> {
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, ControlCodec);
        framed
            .send(ControlFrame::BatchRequest { node: id, count: 0 })
            .await
            .unwrap();
        framed
    }

    async fn reply(framed: &mut Framed<TcpStream, ControlCodec>) -> ControlFrame {
        loop {
            match framed.next().await.unwrap().unwrap() {
                ControlFrame::Heartbeat => continue,
                frame => return frame,
            }
        }
    }

    #[tokio::test]
    async fn grants_and_finishes_are_owned_by_the_announced_node() {
        let fx = fixture(Duration::from_secs(5)).await;
        let mut link = node(fx.addr, 7).await;

        link.send(ControlFrame::BatchRequest { node: 7, count: 3 })
            .await
            .unwrap();
        let ControlFrame::BatchGrant { ids } = reply(&mut link).await else {
            panic!("expected a batch grant");
        };
        assert_eq!(ids.len(), 3);

        link.send(ControlFrame::SingleRequest { token: 11 }).await.unwrap();
        let ControlFrame::SingleGrant { token, xid } = reply(&mut link).await else {
            panic!("expected a single grant");
        };
        assert_eq!(token, 11);

        let owned = fx.sequencer.owned_by(7).await.unwrap();
        assert_eq!(owned.len(), 4);
        assert!(owned.contains(&xid));

        link.send(ControlFrame::Finish {
            token: 12,
            xid,
            committed: true,
        })
        .await
        .unwrap();
        assert_eq!(reply(&mut link).await, ControlFrame::FinishAck { token: 12, xid });
        assert_eq!(fx.sequencer.owned_by(7).await.unwrap().len(), 3);
        fx.sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_batch_requests_are_clamped() {
        let fx = fixture(Duration::from_secs(5)).await;
        let mut link = node(fx.addr, 7).await;

        let mut granted = Vec::new();
        for count in [17_000_000, u32::MAX] {
            link.send(ControlFrame::BatchRequest { node: 7, count })
                .await
                .unwrap();
            let ControlFrame::BatchGrant { ids } = reply(&mut link).await else {
                panic!("expected a batch grant");
            };
            assert!(!ids.is_empty());
            assert!(ids.len() <= MAX_BATCH, "granted {} ids", ids.len());
            granted.extend(ids);
        }

        let mut owned = fx.sequencer.owned_by(7).await.unwrap();
        owned.sort_unstable_by_key(|id| id.to_raw());
        granted.sort_unstable_by_key(|id| id.to_raw());
        assert_eq!(owned, granted);
        fx.sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_finish_is_acknowledged() {
        let fx = fixture(Duration::from_secs(5)).await;
        let mut link = node(fx.addr, 2).await;
        let xid = TransactionId::from_raw(9_999);
        link.send(ControlFrame::Finish {
            token: 1,
            xid,
            committed: false,
        })
        .await
        .unwrap();
        assert_eq!(reply(&mut link).await, ControlFrame::FinishAck { token: 1, xid });
        fx.sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn authority_frames_from_a_node_end_the_session() {
        let mut fx = fixture(Duration::from_secs(5)).await;
        let mut link = node(fx.addr, 4).await;
        link.send(ControlFrame::BatchGrant { ids: Vec::new() })
            .await
            .unwrap();
        assert!(matches!(
            fx.results.recv().await.unwrap(),
            Err(ProtocolError::Unexpected { .. })
        ));
        while let Some(Ok(frame)) = link.next().await {
            assert_eq!(frame, ControlFrame::Heartbeat);
        }
        fx.sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn silent_node_is_dropped() {
        let mut fx = fixture(Duration::from_millis(50)).await;
        let _link = node(fx.addr, 5).await;
        let result = tokio::time::timeout(Duration::from_secs(2), fx.results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), Some(5));
        fx.sequencer.shutdown().await;
    }
}
