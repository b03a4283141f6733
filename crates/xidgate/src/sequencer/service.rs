//! The sequencer loop.
//!
//! One task owns the pool, the outstanding set and the parked-request queue.
//! It wakes on four sources: shutdown, upstream replies from background tasks,
//! the request mailbox, and the replenish tick. Upstream round trips always run
//! in spawned tasks; the loop itself only ever waits on the event sink.

use crate::{
    BootstrapSnapshot, BoundedMailbox, ClusterStatus, Error, FinishOutcome, NodeId,
    OutstandingRow, OutstandingSet, PendingTable, PreAllocationPool, RequestToken,
    SequencerConfig, SequencerDump, SnapshotDelta, SnapshotEvent, TransactionId, Upstream,
    sequencer::request::{Internal, Parked, Request},
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

pub(crate) struct SequencerLoop<U: Upstream> {
    upstream: U,
    config: SequencerConfig,
    requests: Arc<BoundedMailbox<Request>>,
    singles: Arc<PendingTable<TransactionId>>,
    grants: Arc<PendingTable<Vec<TransactionId>>>,
    finishes: Arc<PendingTable<FinishOutcome>>,
    events: Option<Arc<BoundedMailbox<SnapshotEvent>>>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: Option<mpsc::Receiver<Internal>>,
    shutdown: CancellationToken,

    pool: PreAllocationPool,
    outstanding: OutstandingSet,
    parked: VecDeque<Parked>,
    replenishing: bool,
    locked: bool,
    generation: u64,
    watermark: Option<TransactionId>,
    high_water: Option<TransactionId>,
}

impl<U: Upstream> SequencerLoop<U> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        upstream: U,
        config: SequencerConfig,
        requests: Arc<BoundedMailbox<Request>>,
        singles: Arc<PendingTable<TransactionId>>,
        grants: Arc<PendingTable<Vec<TransactionId>>>,
        finishes: Arc<PendingTable<FinishOutcome>>,
        events: Option<Arc<BoundedMailbox<SnapshotEvent>>>,
        shutdown: CancellationToken,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(config.internal_channel_size.max(1));
        let generation = upstream.generation();
        let pool = PreAllocationPool::new(config.pool_target);
        Self {
            upstream,
            config,
            requests,
            singles,
            grants,
            finishes,
            events,
            internal_tx,
            internal_rx: Some(internal_rx),
            shutdown,
            pool,
            outstanding: OutstandingSet::new(),
            parked: VecDeque::new(),
            replenishing: false,
            locked: false,
            generation,
            watermark: None,
            high_water: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        let requests = Arc::clone(&self.requests);
        let shutdown = self.shutdown.clone();
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            node = self.config.node_id,
            pool_target = self.config.pool_target,
            "Sequencer started"
        );
        let reset = SnapshotEvent::Reset(self.snapshot());
        self.emit(reset).await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(msg) = internal_rx.recv() => self.on_internal(msg).await,
                batch = requests.recv_all() => match batch {
                    Some(batch) => {
                        for request in batch {
                            self.on_request(request).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.stop();
    }

    async fn on_tick(&mut self) {
        self.check_generation().await;
        self.serve_parked().await;
        self.maybe_replenish(true);
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Allocate { token, owner } => {
                self.enqueue(Parked::Single { token, owner }).await;
            }
            Request::Grant {
                token,
                owner,
                count,
            } => {
                self.enqueue(Parked::Batch {
                    token,
                    owner,
                    count,
                })
                .await;
            }
            Request::Finish {
                token,
                id,
                committed,
            } => self.on_finish(token, id, committed).await,
            Request::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Request::Dump(reply) => {
                let _ = reply.send(self.dump());
            }
            Request::OwnedBy(owner, reply) => {
                let ids = self
                    .outstanding
                    .entries()
                    .into_iter()
                    .filter(|(_, holder)| holder.owner == owner)
                    .map(|(id, _)| id)
                    .collect();
                let _ = reply.send(ids);
            }
            Request::SetLocked(locked, reply) => {
                if self.locked != locked {
                    self.locked = locked;
                    if locked {
                        tracing::info!("Cluster locked; parking new allocations");
                    } else {
                        tracing::info!(parked = self.parked.len(), "Cluster unlocked");
                    }
                }
                let _ = reply.send(());
                self.serve_parked().await;
            }
        }
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::BatchArrived { generation, result } => {
                self.replenishing = false;
                self.check_generation().await;
                if generation != self.generation {
                    tracing::debug!(generation, "Dropping batch from a previous generation");
                    self.serve_parked().await;
                    return;
                }
                match result {
                    Ok(ids) => {
                        tracing::trace!(count = ids.len(), "Replenished pool");
                        self.pool.merge(ids);
                        self.serve_parked().await;
                    }
                    Err(e) => {
                        tracing::warn!("Replenishment failed: {e}");
                        self.fail_parked(&e);
                    }
                }
            }
            Internal::SingleArrived {
                generation,
                token,
                owner,
                result,
            } => {
                self.check_generation().await;
                match result {
                    Ok(id) if generation == self.generation => {
                        self.hand_out(token, owner, id).await;
                    }
                    Ok(id) => {
                        tracing::debug!(generation, "Dropping {id:?} from a previous generation");
                        let _ = self.singles.complete(
                            token,
                            Err(Error::upstream("upstream generation changed")),
                        );
                    }
                    Err(e) => {
                        let _ = self.singles.complete(token, Err(e));
                    }
                }
            }
            Internal::FinishAcked {
                token,
                id,
                known,
                result,
            } => {
                let outcome = match result {
                    Ok(()) if known => {
                        self.advance_watermark(id);
                        FinishOutcome::Finished
                    }
                    Ok(()) => FinishOutcome::Stale,
                    Err(e) if known => {
                        tracing::warn!("Finish of {id} not acknowledged upstream: {e}");
                        FinishOutcome::Degraded
                    }
                    Err(e) => {
                        tracing::debug!("Forwarded finish of {id} not acknowledged: {e}");
                        FinishOutcome::Stale
                    }
                };
                let _ = self.finishes.complete(token, Ok(outcome));
            }
        }
    }

    /// Routes a new allocate or grant. Requests join the back of the parked
    /// queue whenever anything is already waiting, which keeps service FIFO.
    async fn enqueue(&mut self, request: Parked) {
        self.check_generation().await;
        if !self.upstream.is_ready() {
            self.reject(request, Error::upstream("upstream is not ready"));
            return;
        }
        self.parked.push_back(request);
        self.serve_parked().await;
    }

    /// Serves parked requests from the front until one cannot be satisfied.
    async fn serve_parked(&mut self) {
        while let Some(&next) = self.parked.front() {
            if !self.is_waiting(next) {
                self.parked.pop_front();
                continue;
            }
            if self.locked {
                break;
            }
            if !self.upstream.is_ready() {
                self.fail_parked(&Error::upstream("upstream is not ready"));
                break;
            }
            match next {
                Parked::Single { token, owner } => match self.pool.pop() {
                    Some(id) => {
                        self.parked.pop_front();
                        self.hand_out(token, owner, id).await;
                    }
                    None if self.pool.target() == 0 => {
                        self.parked.pop_front();
                        self.request_single(token, owner);
                    }
                    None => break,
                },
                Parked::Batch {
                    token,
                    owner,
                    count,
                } => {
                    if self.pool.is_empty() {
                        break;
                    }
                    self.parked.pop_front();
                    let ids = self.pool.take(count);
                    self.hand_out_batch(token, owner, ids).await;
                }
            }
        }
        self.maybe_replenish(false);
    }

    /// Records `id` as outstanding, then delivers it. Undeliverable ids go
    /// back to the pool.
    async fn hand_out(&mut self, token: RequestToken, owner: NodeId, id: TransactionId) {
        if !self.outstanding.insert(id, owner) {
            tracing::error!("{id:?} handed out while already outstanding");
        }
        match self.singles.complete(token, Ok(id)) {
            None => {
                self.note_issued(id);
                self.emit(SnapshotEvent::Delta(SnapshotDelta::Assign(vec![id])))
                    .await;
            }
            Some(_) => {
                let _ = self.outstanding.finish(id);
                self.pool.merge([id]);
                tracing::debug!("Requester went away; returned {id:?} to the pool");
            }
        }
    }

    async fn hand_out_batch(
        &mut self,
        token: RequestToken,
        owner: NodeId,
        ids: Vec<TransactionId>,
    ) {
        for &id in &ids {
            if !self.outstanding.insert(id, owner) {
                tracing::error!("{id:?} granted while already outstanding");
            }
        }
        let assigned = ids.clone();
        match self.grants.complete(token, Ok(ids)) {
            None => {
                for &id in &assigned {
                    self.note_issued(id);
                }
                self.emit(SnapshotEvent::Delta(SnapshotDelta::Assign(assigned)))
                    .await;
            }
            Some(_) => {
                for &id in &assigned {
                    let _ = self.outstanding.finish(id);
                }
                tracing::debug!(
                    count = assigned.len(),
                    "Grantee went away; returned batch to the pool"
                );
                self.pool.merge(assigned);
            }
        }
    }

    /// Removes `id` from the outstanding set and reports it upstream.
    ///
    /// Ids this sequencer does not know are still reported: after a reconnect
    /// the local bookkeeping is gone, but the upstream may still hold the id
    /// as outstanding. Those finishes resolve as [`FinishOutcome::Stale`]
    /// whatever the upstream answers.
    async fn on_finish(&mut self, token: RequestToken, id: TransactionId, committed: bool) {
        self.check_generation().await;
        let known = match self.outstanding.finish(id) {
            Ok(_) => {
                tracing::trace!(committed, "Finished {id:?}");
                self.emit(SnapshotEvent::Delta(SnapshotDelta::Commit(vec![id])))
                    .await;
                true
            }
            Err(e) => {
                tracing::warn!("{e}; treating as already finished");
                false
            }
        };

        if !self.upstream.is_ready() {
            let outcome = if known {
                tracing::warn!("Upstream unavailable; finish of {id} recorded locally only");
                FinishOutcome::Degraded
            } else {
                FinishOutcome::Stale
            };
            let _ = self.finishes.complete(token, Ok(outcome));
            return;
        }

        let upstream = self.upstream.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = upstream.finish(id, committed).await;
            let _ = tx
                .send(Internal::FinishAcked {
                    token,
                    id,
                    known,
                    result,
                })
                .await;
        });
    }

    /// Requests a batch if none is in flight and either the tick found the
    /// pool at or below its low-water mark or parked requests outnumber the
    /// pooled ids.
    fn maybe_replenish(&mut self, low_water_check: bool) {
        if self.replenishing || !self.upstream.is_ready() {
            return;
        }
        let demand: usize = self
            .parked
            .iter()
            .filter(|p| self.is_waiting(**p))
            .filter(|p| self.pool.target() > 0 || matches!(p, Parked::Batch { .. }))
            .map(Parked::demand)
            .sum();
        let short = demand.saturating_sub(self.pool.len());
        let low = low_water_check && self.pool.is_low();
        if !low && short == 0 {
            return;
        }
        let count = if self.pool.target() > 0 {
            self.pool.deficit().max(short)
        } else {
            short
        };

        self.replenishing = true;
        let upstream = self.upstream.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tracing::trace!(count, pooled = self.pool.len(), "Requesting replenishment");
        tokio::spawn(async move {
            let result = upstream.request_batch(count).await;
            let _ = tx.send(Internal::BatchArrived { generation, result }).await;
        });
    }

    fn request_single(&self, token: RequestToken, owner: NodeId) {
        let upstream = self.upstream.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = upstream.request_one().await;
            let _ = tx
                .send(Internal::SingleArrived {
                    generation,
                    token,
                    owner,
                    result,
                })
                .await;
        });
    }

    /// Discards pool and outstanding bookkeeping if the upstream lost state.
    async fn check_generation(&mut self) {
        let current = self.upstream.generation();
        if current == self.generation {
            return;
        }
        let pooled = self.pool.clear();
        let outstanding = self.outstanding.clear();
        tracing::info!(
            from = self.generation,
            to = current,
            pooled,
            outstanding,
            "Upstream generation changed; discarding local bookkeeping"
        );
        self.generation = current;
        let reset = SnapshotEvent::Reset(self.snapshot());
        self.emit(reset).await;
    }

    fn advance_watermark(&mut self, id: TransactionId) {
        self.watermark = match self.watermark {
            Some(current) if !id.follows(current) => Some(current),
            _ => Some(id),
        };
    }

    fn note_issued(&mut self, id: TransactionId) {
        self.high_water = Some(match self.high_water {
            Some(current) => current.newest(id),
            None => id,
        });
    }

    fn xmax(&self) -> TransactionId {
        self.high_water
            .map(TransactionId::next)
            .or_else(|| self.pool.peek())
            .unwrap_or(TransactionId::FIRST)
    }

    fn snapshot(&self) -> BootstrapSnapshot {
        self.outstanding.snapshot(self.xmax())
    }

    fn status(&self) -> ClusterStatus {
        ClusterStatus {
            locked: self.locked,
            ready: self.upstream.is_ready(),
            generation: self.generation,
            pooled: self.pool.len(),
            outstanding: self.outstanding.len(),
            parked: self.parked.len(),
            watermark: self.watermark,
            high_water: self.high_water,
        }
    }

    fn dump(&self) -> SequencerDump {
        let now = Instant::now();
        SequencerDump {
            node_id: self.config.node_id,
            status: self.status(),
            replenishing: self.replenishing,
            pool: self.pool.iter().collect(),
            outstanding: self
                .outstanding
                .entries()
                .into_iter()
                .map(|(xid, holder)| OutstandingRow {
                    xid,
                    owner: holder.owner,
                    age: now.duration_since(holder.since),
                })
                .collect(),
            leak_after: self.config.leak_threshold,
        }
    }

    async fn emit(&mut self, event: SnapshotEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if events.push(event).await.is_err() {
            tracing::debug!("Snapshot sink closed; no longer emitting events");
            self.events = None;
        }
    }

    fn is_waiting(&self, parked: Parked) -> bool {
        match parked {
            Parked::Single { token, .. } => self.singles.is_waiting(token),
            Parked::Batch { token, .. } => self.grants.is_waiting(token),
        }
    }

    fn reject(&self, parked: Parked, err: Error) {
        match parked {
            Parked::Single { token, .. } => {
                let _ = self.singles.complete(token, Err(err));
            }
            Parked::Batch { token, .. } => {
                let _ = self.grants.complete(token, Err(err));
            }
        }
    }

    fn fail_parked(&mut self, err: &Error) {
        if self.parked.is_empty() {
            return;
        }
        tracing::warn!(parked = self.parked.len(), "Failing parked requests: {err}");
        while let Some(parked) = self.parked.pop_front() {
            self.reject(parked, err.clone());
        }
    }

    fn stop(&mut self) {
        self.requests.close();
        for request in self.requests.drain_all() {
            match request {
                Request::Allocate { token, .. } => {
                    let _ = self.singles.complete(token, Err(Error::ServiceShutdown));
                }
                Request::Grant { token, .. } => {
                    let _ = self.grants.complete(token, Err(Error::ServiceShutdown));
                }
                Request::Finish { token, .. } => {
                    let _ = self.finishes.complete(token, Err(Error::ServiceShutdown));
                }
                // Dropping the reply channel wakes the caller with a shutdown error.
                _ => {}
            }
        }
        self.fail_parked(&Error::ServiceShutdown);
        let woken = self.singles.fail_all(&Error::ServiceShutdown)
            + self.grants.fail_all(&Error::ServiceShutdown)
            + self.finishes.fail_all(&Error::ServiceShutdown);
        if let Some(events) = &self.events {
            events.close();
        }
        tracing::debug!(
            woken,
            outstanding = self.outstanding.len(),
            "Sequencer stopped"
        );
    }
}
