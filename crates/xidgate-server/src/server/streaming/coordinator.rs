//! Fan-out loop for snapshot deltas.
//!
//! A single task drains the sequencer's event mailbox, keeps a mirror
//! [`SnapshotView`] of the running set, serializes each delta batch once and
//! queues the same [`Bytes`] on every streaming subscriber. Joins are handled
//! by the same task, so the bootstrap a new subscriber receives is exactly
//! the state after the last batch fanned out before it, and every later batch
//! reaches it.

use crate::server::telemetry::{
    decrement_subscribers_streaming, increment_subscribers_streaming, record_fanout_bytes,
};
use bytes::Bytes;
use core::fmt;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use xidgate::{
    BoundedMailbox, Error, Result, SnapshotDelta, SnapshotEvent, SnapshotView, TransactionId,
};
use xidgate_proto::{MAX_IDS_PER_FRAME, StreamFrame};

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Accepted, handshake not finished.
    Connected,
    /// Receiving deltas.
    Streaming,
    /// Stopped; flushing what is already queued.
    Exiting,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Exiting => "exiting",
        })
    }
}

/// Bookkeeping shared by the fan-out loop and one subscriber task.
#[derive(Debug)]
pub struct SubscriberShared {
    id: SubscriberId,
    peer: SocketAddr,
    state: Mutex<SubscriberState>,
    backlog: AtomicUsize,
    position: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl SubscriberShared {
    fn new(id: SubscriberId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(SubscriberState::Connected),
            backlog: AtomicUsize::new(0),
            position: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SubscriberState) {
        *self.state.lock() = state;
    }

    /// Bytes queued for this subscriber but not yet written to its socket.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    /// Frames the subscriber last reported as consumed.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn record_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
        self.touch();
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn queued(&self, bytes: usize) {
        self.backlog.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn written(&self, bytes: usize) {
        self.backlog.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// What a subscriber task gets back from [`SnapshotBroadcaster::join`].
///
/// `frames` already holds the acceptance and bootstrap frames.
#[derive(Debug)]
pub struct Subscription {
    pub shared: Arc<SubscriberShared>,
    pub frames: mpsc::UnboundedReceiver<Bytes>,
}

/// One row of a [`BroadcasterDump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberRow {
    pub id: SubscriberId,
    pub peer: SocketAddr,
    pub state: SubscriberState,
    pub backlog: usize,
    pub position: u64,
    pub idle: Duration,
}

/// Operator-facing copy of the broadcaster's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcasterDump {
    pub xmax: TransactionId,
    pub running: usize,
    pub subscribers: Vec<SubscriberRow>,
    pub backlog_warn_bytes: usize,
}

impl fmt::Display for BroadcasterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "broadcaster: xmax={} running={} subscribers={}",
            self.xmax,
            self.running,
            self.subscribers.len()
        )?;
        for row in &self.subscribers {
            write!(
                f,
                "  #{} {} {} backlog={}B position={} idle={:?}",
                row.id, row.peer, row.state, row.backlog, row.position, row.idle
            )?;
            if row.backlog > self.backlog_warn_bytes {
                f.write_str(" SLOW")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

enum Command {
    Join {
        peer: SocketAddr,
        reply: oneshot::Sender<Subscription>,
    },
    Dump(oneshot::Sender<BroadcasterDump>),
}

/// Handle to the fan-out loop.
#[derive(Clone)]
pub struct SnapshotBroadcaster {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for SnapshotBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotBroadcaster")
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SnapshotBroadcaster {
    /// Starts the fan-out loop over `events`.
    ///
    /// Joins are held back until the sequencer's initial reset has been
    /// applied, so no subscriber bootstraps from an unprimed mirror.
    pub fn spawn(
        events: Arc<BoundedMailbox<SnapshotEvent>>,
        heartbeat_interval: Duration,
        backlog_warn_bytes: usize,
    ) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let fan_out = FanOut {
            events,
            commands: rx,
            view: SnapshotView::default(),
            primed: false,
            subscribers: Vec::new(),
            next_id: 1,
            heartbeat_interval,
            backlog_warn_bytes,
            last_sent: Instant::now(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(fan_out.run());
        Self {
            commands,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Registers a streaming subscriber.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] if the loop has stopped.
    pub async fn join(&self, peer: SocketAddr) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Join { peer, reply })
            .await
            .map_err(|_| Error::ServiceShutdown)?;
        rx.await.map_err(|_| Error::ServiceShutdown)
    }

    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] if the loop has stopped.
    pub async fn dump(&self) -> Result<BroadcasterDump> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dump(reply))
            .await
            .map_err(|_| Error::ServiceShutdown)?;
        rx.await.map_err(|_| Error::ServiceShutdown)
    }

    /// Stops the loop. Subscribers keep whatever is already queued for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Broadcaster loop panicked: {e}");
            }
        }
    }
}

struct Subscriber {
    shared: Arc<SubscriberShared>,
    tx: mpsc::UnboundedSender<Bytes>,
    slow: bool,
}

struct FanOut {
    events: Arc<BoundedMailbox<SnapshotEvent>>,
    commands: mpsc::Receiver<Command>,
    view: SnapshotView,
    primed: bool,
    subscribers: Vec<Subscriber>,
    next_id: SubscriberId,
    heartbeat_interval: Duration,
    backlog_warn_bytes: usize,
    last_sent: Instant,
    shutdown: CancellationToken,
}

impl FanOut {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                batch = self.events.recv_all() => match batch {
                    Some(batch) => self.publish(batch),
                    None => {
                        tracing::info!("Event mailbox closed, stopping broadcaster");
                        break;
                    }
                },
                Some(command) = self.commands.recv(), if self.primed => self.handle(command),
                _ = tick.tick() => self.on_tick(),
            }
        }

        for _ in self.subscribers.drain(..) {
            decrement_subscribers_streaming();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join { peer, reply } => {
                let subscription = self.join(peer);
                let id = subscription.shared.id();
                if reply.send(subscription).is_err() {
                    // The subscriber task gave up; its receiver is gone.
                    self.remove(|s| s.shared.id() == id);
                }
            }
            Command::Dump(reply) => {
                let _ = reply.send(self.dump());
            }
        }
    }

    fn join(&mut self, peer: SocketAddr) -> Subscription {
        let (tx, frames) = mpsc::unbounded_channel();
        let shared = Arc::new(SubscriberShared::new(self.next_id, peer));
        self.next_id += 1;

        let bootstrap = self.view.bootstrap();
        tracing::info!(
            subscriber = shared.id(),
            %peer,
            xmin = %bootstrap.xmin,
            xmax = %bootstrap.xmax,
            running = bootstrap.xip.len(),
            "Subscriber streaming"
        );
        for frame in [StreamFrame::Accepted, StreamFrame::Bootstrap(bootstrap)] {
            let bytes = frame.to_bytes();
            shared.queued(bytes.len());
            let _ = tx.send(bytes);
        }
        shared.set_state(SubscriberState::Streaming);
        increment_subscribers_streaming();

        self.subscribers.push(Subscriber {
            shared: Arc::clone(&shared),
            tx,
            slow: false,
        });
        Subscription { shared, frames }
    }

    fn publish(&mut self, batch: Vec<SnapshotEvent>) {
        let mut pending: Option<SnapshotDelta> = None;
        for event in batch {
            match event {
                SnapshotEvent::Reset(snapshot) => {
                    if let Some(delta) = pending.take() {
                        self.fan_out(delta);
                    }
                    self.view.reset(&snapshot);
                    if self.primed && !self.subscribers.is_empty() {
                        tracing::warn!(
                            subscribers = self.subscribers.len(),
                            "Sequencer reset; dropping subscribers so they re-bootstrap"
                        );
                        self.remove(|_| true);
                    }
                    self.primed = true;
                }
                SnapshotEvent::Delta(delta) => {
                    let anomalies = self.view.apply(&delta);
                    if !anomalies.is_empty() {
                        tracing::warn!(
                            assign = delta.is_assign(),
                            ?anomalies,
                            "Delta did not fit the mirrored running set"
                        );
                    }
                    pending = match (pending.take(), delta) {
                        (Some(SnapshotDelta::Assign(mut ids)), SnapshotDelta::Assign(more))
                            if ids.len() + more.len() <= MAX_IDS_PER_FRAME =>
                        {
                            ids.extend(more);
                            Some(SnapshotDelta::Assign(ids))
                        }
                        (Some(SnapshotDelta::Commit(mut ids)), SnapshotDelta::Commit(more))
                            if ids.len() + more.len() <= MAX_IDS_PER_FRAME =>
                        {
                            ids.extend(more);
                            Some(SnapshotDelta::Commit(ids))
                        }
                        (Some(previous), delta) => {
                            self.fan_out(previous);
                            Some(delta)
                        }
                        (None, delta) => Some(delta),
                    };
                }
            }
        }
        if let Some(delta) = pending {
            self.fan_out(delta);
        }
    }

    /// Serializes `delta` once and queues it on every streaming subscriber.
    /// A delta over [`MAX_IDS_PER_FRAME`] ids goes out as several frames of
    /// the same kind, in order.
    fn fan_out(&mut self, delta: SnapshotDelta) {
        if delta.ids().len() <= MAX_IDS_PER_FRAME {
            self.send_delta(delta);
            return;
        }
        let assign = delta.is_assign();
        for chunk in delta.ids().chunks(MAX_IDS_PER_FRAME) {
            let ids = chunk.to_vec();
            self.send_delta(if assign {
                SnapshotDelta::Assign(ids)
            } else {
                SnapshotDelta::Commit(ids)
            });
        }
    }

    fn send_delta(&mut self, delta: SnapshotDelta) {
        let bytes = StreamFrame::from(delta).to_bytes();
        record_fanout_bytes(bytes.len() as f64);
        self.send_all(&bytes);
    }

    fn send_all(&mut self, bytes: &Bytes) {
        self.last_sent = Instant::now();
        let warn_at = self.backlog_warn_bytes;
        let mut closed = false;
        for subscriber in &mut self.subscribers {
            if subscriber.shared.state() != SubscriberState::Streaming {
                continue;
            }
            subscriber.shared.queued(bytes.len());
            if subscriber.tx.send(bytes.clone()).is_err() {
                subscriber.shared.written(bytes.len());
                closed = true;
                continue;
            }
            let backlog = subscriber.shared.backlog();
            if backlog > warn_at && !subscriber.slow {
                subscriber.slow = true;
                tracing::warn!(
                    subscriber = subscriber.shared.id(),
                    peer = %subscriber.shared.peer(),
                    backlog,
                    "Subscriber backlog above warning threshold"
                );
            } else if backlog <= warn_at {
                subscriber.slow = false;
            }
        }
        if closed {
            self.remove(|s| s.tx.is_closed());
        }
    }

    fn on_tick(&mut self) {
        self.remove(|s| s.tx.is_closed());
        if self.last_sent.elapsed() >= self.heartbeat_interval {
            self.send_all(&StreamFrame::Heartbeat.to_bytes());
        }
    }

    fn remove(&mut self, mut gone: impl FnMut(&Subscriber) -> bool) {
        self.subscribers.retain(|s| {
            if gone(s) {
                tracing::debug!(subscriber = s.shared.id(), "Subscriber removed from fan-out");
                decrement_subscribers_streaming();
                false
            } else {
                true
            }
        });
    }

    fn dump(&self) -> BroadcasterDump {
        BroadcasterDump {
            xmax: self.view.xmax(),
            running: self.view.len(),
            subscribers: self
                .subscribers
                .iter()
                .map(|s| SubscriberRow {
                    id: s.shared.id(),
                    peer: s.shared.peer(),
                    state: s.shared.state(),
                    backlog: s.shared.backlog(),
                    position: s.shared.position(),
                    idle: s.shared.idle(),
                })
                .collect(),
            backlog_warn_bytes: self.backlog_warn_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;
    use xidgate::BootstrapSnapshot;
    use xidgate_proto::ClientCodec;

    fn xids(raw: &[u32]) -> Vec<TransactionId> {
        raw.iter().copied().map(TransactionId::from_raw).collect()
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    fn primed(events: &BoundedMailbox<SnapshotEvent>) {
        events
            .try_push(SnapshotEvent::Reset(BootstrapSnapshot::empty(
                TransactionId::from_raw(3),
            )))
            .unwrap();
    }

    async fn next_frame(sub: &mut Subscription) -> StreamFrame {
        let bytes = sub.frames.recv().await.unwrap();
        sub.shared.written(bytes.len());
        let mut buf = BytesMut::from(&bytes[..]);
        ClientCodec.decode(&mut buf).unwrap().unwrap()
    }

    fn delta(event: SnapshotDelta) -> SnapshotEvent {
        SnapshotEvent::Delta(event)
    }

    #[tokio::test]
    async fn late_joiner_bootstraps_from_the_mirror() {
        let events = Arc::new(BoundedMailbox::new(64));
        primed(&events);
        let broadcaster =
            SnapshotBroadcaster::spawn(Arc::clone(&events), Duration::from_secs(60), 1024);

        events
            .try_push(delta(SnapshotDelta::Assign(xids(&[3, 4, 5, 6, 7]))))
            .unwrap();
        events
            .try_push(delta(SnapshotDelta::Commit(xids(&[4, 6]))))
            .unwrap();

        let mut sub = broadcaster.join(peer()).await.unwrap();
        assert_eq!(next_frame(&mut sub).await, StreamFrame::Accepted);
        let StreamFrame::Bootstrap(snapshot) = next_frame(&mut sub).await else {
            panic!("expected a bootstrap frame");
        };
        assert_eq!(snapshot.xip, xids(&[3, 5, 7]));
        assert_eq!(snapshot.xmax, TransactionId::from_raw(8));

        events
            .try_push(delta(SnapshotDelta::Commit(xids(&[5]))))
            .unwrap();
        assert_eq!(
            next_frame(&mut sub).await,
            StreamFrame::Commit(xids(&[5]))
        );
        assert_eq!(sub.shared.backlog(), 0);
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn adjacent_deltas_of_one_kind_share_a_frame() {
        let events = Arc::new(BoundedMailbox::new(64));
        primed(&events);
        let broadcaster =
            SnapshotBroadcaster::spawn(Arc::clone(&events), Duration::from_secs(60), 1024);
        let mut sub = broadcaster.join(peer()).await.unwrap();
        next_frame(&mut sub).await;
        next_frame(&mut sub).await;

        // Queue the whole batch before the loop can wake.
        let batch = [
            delta(SnapshotDelta::Assign(xids(&[3]))),
            delta(SnapshotDelta::Assign(xids(&[4]))),
            delta(SnapshotDelta::Commit(xids(&[3]))),
            delta(SnapshotDelta::Assign(xids(&[5]))),
        ];
        for event in batch {
            events.try_push(event).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match next_frame(&mut sub).await {
                StreamFrame::Assign(ids) => seen.push((true, ids)),
                StreamFrame::Commit(ids) => seen.push((false, ids)),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        let assigned: Vec<_> = seen
            .iter()
            .filter(|(assign, _)| *assign)
            .flat_map(|(_, ids)| ids.clone())
            .collect();
        assert_eq!(assigned, xids(&[3, 4, 5]));
        // The commit for 3 never overtakes its assign.
        let commit_at = seen.iter().position(|(assign, _)| !assign).unwrap();
        assert!(seen[..commit_at].iter().any(|(_, ids)| ids.contains(&xids(&[3])[0])));
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_delta_is_split_into_frames() {
        let events = Arc::new(BoundedMailbox::new(8));
        primed(&events);
        let broadcaster =
            SnapshotBroadcaster::spawn(Arc::clone(&events), Duration::from_secs(60), usize::MAX);
        let mut sub = broadcaster.join(peer()).await.unwrap();
        next_frame(&mut sub).await;
        next_frame(&mut sub).await;

        let count = 2 * MAX_IDS_PER_FRAME + 5;
        let ids: Vec<_> = (3..3 + count as u32).map(TransactionId::from_raw).collect();
        events
            .try_push(delta(SnapshotDelta::Assign(ids.clone())))
            .unwrap();

        let mut sizes = Vec::new();
        let mut received = Vec::new();
        while received.len() < count {
            let StreamFrame::Assign(chunk) = next_frame(&mut sub).await else {
                panic!("expected an assign frame");
            };
            sizes.push(chunk.len());
            received.extend(chunk);
        }
        assert_eq!(sizes, vec![MAX_IDS_PER_FRAME, MAX_IDS_PER_FRAME, 5]);
        assert_eq!(received, ids);
        assert_eq!(broadcaster.dump().await.unwrap().running, count);
        broadcaster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_gets_heartbeats() {
        let events = Arc::new(BoundedMailbox::new(8));
        primed(&events);
        let broadcaster =
            SnapshotBroadcaster::spawn(Arc::clone(&events), Duration::from_millis(100), 1024);
        let mut sub = broadcaster.join(peer()).await.unwrap();
        next_frame(&mut sub).await;
        next_frame(&mut sub).await;

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(next_frame(&mut sub).await, StreamFrame::Heartbeat);
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn reset_drops_streaming_subscribers() {
        let events = Arc::new(BoundedMailbox::new(8));
        primed(&events);
        let broadcaster =
            SnapshotBroadcaster::spawn(Arc::clone(&events), Duration::from_secs(60), 1024);
        let mut sub = broadcaster.join(peer()).await.unwrap();
        next_frame(&mut sub).await;
        next_frame(&mut sub).await;

        primed(&events);
        assert!(sub.frames.recv().await.is_none());
        assert!(broadcaster.dump().await.unwrap().subscribers.is_empty());
        broadcaster.shutdown().await;
    }

    #[tokio::test]
    async fn dump_lists_subscribers_and_flags_slow_ones() {
        let events = Arc::new(BoundedMailbox::new(8));
        primed(&events);
        let broadcaster =
            SnapshotBroadcaster::spawn(Arc::clone(&events), Duration::from_secs(60), 4);
        let sub = broadcaster.join(peer()).await.unwrap();
        sub.shared.record_position(2);

        let dump = broadcaster.dump().await.unwrap();
        assert_eq!(dump.subscribers.len(), 1);
        let row = &dump.subscribers[0];
        assert_eq!(row.state, SubscriberState::Streaming);
        assert_eq!(row.position, 2);
        assert!(row.backlog > 4);
        assert!(dump.to_string().contains("SLOW"));
        broadcaster.shutdown().await;
    }
}
