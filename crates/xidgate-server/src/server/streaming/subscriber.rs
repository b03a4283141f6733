//! One task per broadcast connection.
//!
//! The task owns the socket. It reads the start command, joins the
//! [`SnapshotBroadcaster`], then writes whatever the fan-out loop queues for
//! it while reading acks from the subscriber. A failure here ends this
//! connection and nothing else.

use super::coordinator::{SnapshotBroadcaster, SubscriberState, Subscription};
use core::time::Duration;
use futures::{SinkExt, StreamExt};
use std::{io, net::SocketAddr};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::{codec::Framed, sync::CancellationToken};
use xidgate_proto::{ProtocolError, START_STREAM_COMMAND, ServerCodec, SubscriberRequest};

/// Frames written per flush while draining the queue.
const WRITE_BATCH: usize = 64;

/// Serves one subscriber until it stops, the broadcaster drops it, or
/// `shutdown` fires.
///
/// # Errors
///
/// Any [`ProtocolError`] from the handshake, a malformed frame, or a failed
/// write.
pub async fn serve_subscriber(
    socket: TcpStream,
    peer: SocketAddr,
    broadcaster: SnapshotBroadcaster,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), ProtocolError> {
    let _ = socket.set_nodelay(true);
    let mut framed = Framed::new(socket, ServerCodec);

    let first = match timeout(handshake_timeout, framed.next()).await {
        Ok(first) => first,
        Err(_) => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no start command").into());
        }
    };
    match first {
        Some(Ok(SubscriberRequest::Command(command))) if command == START_STREAM_COMMAND => {}
        Some(Ok(SubscriberRequest::Command(command))) => {
            return Err(ProtocolError::BadCommand(command));
        }
        Some(Ok(other)) => {
            return Err(ProtocolError::Unexpected {
                expected: "start command",
                got: format!("{other:?}"),
            });
        }
        Some(Err(e)) => return Err(e),
        None => return Err(ProtocolError::ConnectionClosed),
    }

    let Ok(Subscription { shared, mut frames }) = broadcaster.join(peer).await else {
        tracing::debug!(%peer, "Broadcaster stopped before subscriber joined");
        return Ok(());
    };
    let (mut sink, mut requests) = framed.split();

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            queued = frames.recv() => {
                let Some(bytes) = queued else {
                    // Dropped by the fan-out loop.
                    break;
                };
                let mut written = bytes.len();
                sink.feed(bytes).await?;
                for _ in 1..WRITE_BATCH {
                    let Ok(more) = frames.try_recv() else {
                        break;
                    };
                    written += more.len();
                    sink.feed(more).await?;
                }
                sink.flush().await?;
                shared.written(written);
            }
            request = requests.next() => match request {
                Some(Ok(SubscriberRequest::Position(position))) => shared.record_position(position),
                Some(Ok(SubscriberRequest::KeepAlive)) => shared.touch(),
                Some(Ok(SubscriberRequest::Stop)) => {
                    shared.set_state(SubscriberState::Exiting);
                    tracing::info!(subscriber = shared.id(), %peer, "Subscriber stopping");
                    break;
                }
                Some(Ok(SubscriberRequest::Command(command))) => {
                    return Err(ProtocolError::Unexpected {
                        expected: "ack, keepalive or stop",
                        got: format!("command {command:?}"),
                    });
                }
                Some(Err(e)) => return Err(e),
                None => {
                    tracing::info!(subscriber = shared.id(), %peer, "Subscriber disconnected");
                    return Ok(());
                }
            },
        }
    }

    // Exiting: flush what was already queued, then close.
    shared.set_state(SubscriberState::Exiting);
    frames.close();
    let mut written = 0;
    while let Some(bytes) = frames.recv().await {
        written += bytes.len();
        sink.feed(bytes).await?;
    }
    sink.flush().await?;
    shared.written(written);
    sink.close().await?;
    Ok(())
}
