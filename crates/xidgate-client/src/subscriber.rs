use core::time::Duration;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_util::codec::Framed;
use xidgate::{BootstrapSnapshot, SnapshotDelta, SnapshotView, TransactionId};
use xidgate_proto::{ClientCodec, ProtocolError, StreamFrame, SubscriberRequest};

/// Delta frames consumed between two position reports.
pub const DEFAULT_ACK_EVERY: u64 = 64;

/// What [`SnapshotSubscriber::next_event`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// A delta, already applied to the local view.
    Delta(SnapshotDelta),
    /// The broadcaster had nothing to send for one interval.
    Heartbeat,
}

/// Node-side consumer of the snapshot broadcast.
///
/// Keeps a [`SnapshotView`] in step with the authority: the view starts
/// from the bootstrap the broadcaster sends right after the handshake and
/// every delta read through [`Self::next_event`] is applied before it is
/// returned.
#[derive(Debug)]
pub struct SnapshotSubscriber<S = TcpStream> {
    framed: Framed<S, ClientCodec>,
    bootstrap: BootstrapSnapshot,
    view: SnapshotView,
    consumed: u64,
    ack_every: u64,
    anomalies: u64,
}

impl SnapshotSubscriber<TcpStream> {
    /// Connects to a broadcaster and completes the handshake within `limit`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Io`] when the connection fails or times out, and any
    /// protocol error raised by [`Self::handshake`].
    pub async fn connect(addr: &str, limit: Duration) -> Result<Self, ProtocolError> {
        let attempt = async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Self::handshake(stream).await
        };
        match timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("snapshot handshake with {addr} timed out"),
            )
            .into()),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SnapshotSubscriber<S> {
    /// Sends the stream-start command over `stream` and reads the acceptance
    /// and bootstrap frames.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Unexpected`] if the server answers with anything
    /// other than `k` followed by `s`, or [`ProtocolError::ConnectionClosed`]
    /// if it hangs up first.
    pub async fn handshake(stream: S) -> Result<Self, ProtocolError> {
        let mut framed = Framed::new(stream, ClientCodec);
        framed.send(SubscriberRequest::start()).await?;

        match next_frame(&mut framed).await? {
            StreamFrame::Accepted => {}
            other => return Err(unexpected("stream acceptance", &other)),
        }
        let bootstrap = match next_frame(&mut framed).await? {
            StreamFrame::Bootstrap(snapshot) => snapshot,
            other => return Err(unexpected("bootstrap snapshot", &other)),
        };
        tracing::debug!(%bootstrap, "Snapshot stream started");

        Ok(Self {
            framed,
            view: SnapshotView::from_bootstrap(&bootstrap),
            bootstrap,
            consumed: 0,
            ack_every: DEFAULT_ACK_EVERY,
            anomalies: 0,
        })
    }

    /// Reports the consumed position every `frames` deltas. `0` disables
    /// position reports.
    #[must_use]
    pub const fn with_ack_every(mut self, frames: u64) -> Self {
        self.ack_every = frames;
        self
    }

    /// The snapshot received during the handshake.
    pub const fn bootstrap(&self) -> &BootstrapSnapshot {
        &self.bootstrap
    }

    /// Local visibility state.
    pub const fn view(&self) -> &SnapshotView {
        &self.view
    }

    pub fn is_visible(&self, id: TransactionId) -> bool {
        self.view.is_visible(id)
    }

    /// Delta frames consumed since the handshake.
    pub const fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Ids that arrived out of lifecycle order: assigned twice, or committed
    /// without being running.
    pub const fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Reads and applies the next frame. Returns `None` once the server
    /// closes the stream.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`]. The stream is unusable afterwards.
    pub async fn next_event(&mut self) -> Result<Option<SubscriberEvent>, ProtocolError> {
        let Some(frame) = self.framed.next().await.transpose()? else {
            return Ok(None);
        };
        let event = match frame {
            StreamFrame::Assign(ids) => {
                let delta = SnapshotDelta::Assign(ids);
                self.apply(&delta).await?;
                SubscriberEvent::Delta(delta)
            }
            StreamFrame::Commit(ids) => {
                let delta = SnapshotDelta::Commit(ids);
                self.apply(&delta).await?;
                SubscriberEvent::Delta(delta)
            }
            StreamFrame::Heartbeat => {
                self.framed.send(SubscriberRequest::KeepAlive).await?;
                SubscriberEvent::Heartbeat
            }
            other => return Err(unexpected("assign, commit or heartbeat", &other)),
        };
        Ok(Some(event))
    }

    /// Asks the server to stop, applies whatever it flushes before closing,
    /// and returns the final view.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] raised while draining.
    pub async fn stop(mut self) -> Result<SnapshotView, ProtocolError> {
        self.framed.send(SubscriberRequest::Stop).await?;
        while let Some(frame) = self.framed.next().await.transpose()? {
            match frame {
                StreamFrame::Assign(ids) => {
                    let misfits = self.view.apply_assign(&ids);
                    self.note(misfits, "assigned twice");
                }
                StreamFrame::Commit(ids) => {
                    let misfits = self.view.apply_commit(&ids);
                    self.note(misfits, "committed while not running");
                }
                StreamFrame::Heartbeat => {}
                other => return Err(unexpected("assign, commit or heartbeat", &other)),
            }
        }
        tracing::debug!(consumed = self.consumed, "Snapshot stream stopped");
        Ok(self.view)
    }

    async fn apply(&mut self, delta: &SnapshotDelta) -> Result<(), ProtocolError> {
        let misfits = self.view.apply(delta);
        let what = if delta.is_assign() {
            "assigned twice"
        } else {
            "committed while not running"
        };
        self.note(misfits, what);

        self.consumed += 1;
        if self.ack_every > 0 && self.consumed % self.ack_every == 0 {
            self.framed
                .send(SubscriberRequest::Position(self.consumed))
                .await?;
        }
        Ok(())
    }

    fn note(&mut self, misfits: Vec<TransactionId>, what: &str) {
        if misfits.is_empty() {
            return;
        }
        self.anomalies += misfits.len() as u64;
        tracing::warn!(?misfits, "Snapshot stream ids {what}");
    }
}

async fn next_frame<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S, ClientCodec>,
) -> Result<StreamFrame, ProtocolError> {
    framed
        .next()
        .await
        .transpose()?
        .ok_or(ProtocolError::ConnectionClosed)
}

fn unexpected(expected: &'static str, got: &StreamFrame) -> ProtocolError {
    ProtocolError::Unexpected {
        expected,
        got: format!("{:?}", char::from(got.tag())),
    }
}
