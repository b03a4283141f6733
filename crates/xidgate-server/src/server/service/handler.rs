//! The authority service.
//!
//! [`AuthorityService`] is the concrete service behind `xidgate-server`. It
//! owns the cluster's root [`IdentitySequencer`] (fed by a [`LocalLedger`])
//! and the [`SnapshotBroadcaster`] that streams its assign and finish events.
//!
//! ## Responsibilities
//!
//! - Wire the sequencer's event mailbox into the broadcaster.
//! - Accept node connections on the control address and subscriber
//!   connections on the broadcast address, one supervised task each.
//! - Combine both diagnostics dumps for operators.
//! - Stop accepting, let connections drain, and stop both loops on shutdown.

use crate::server::{
    config::ServerConfig,
    service::session::{SessionConfig, report_orphans, serve_node},
    streaming::{coordinator::SnapshotBroadcaster, subscriber::serve_subscriber},
    telemetry::increment_subscriber_drops,
};
use futures::StreamExt;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::timeout,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use xidgate::{BoundedMailbox, IdentitySequencer, LocalLedger, Result};

/// Both listening sockets, bound before the service starts serving.
#[derive(Debug)]
pub struct Listeners {
    pub control: TcpListener,
    pub broadcast: TcpListener,
}

impl Listeners {
    /// Binds the control and broadcast addresses from `config`.
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        Ok(Self {
            control: TcpListener::bind(&config.control_addr).await?,
            broadcast: TcpListener::bind(&config.broadcast_addr).await?,
        })
    }

    pub fn control_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn broadcast_addr(&self) -> io::Result<SocketAddr> {
        self.broadcast.local_addr()
    }
}

/// The cluster's transaction id authority.
///
/// Cheap to clone: every clone shares the same sequencer, broadcaster and
/// shutdown token.
#[derive(Clone, Debug)]
pub struct AuthorityService {
    config: ServerConfig,
    sequencer: IdentitySequencer,
    broadcaster: SnapshotBroadcaster,
    shutdown: CancellationToken,
}

impl AuthorityService {
    /// Starts the sequencer and the broadcaster on the current Tokio runtime.
    /// Nothing is accepted until [`Self::serve`] runs.
    pub fn start(config: ServerConfig) -> Self {
        let events = Arc::new(BoundedMailbox::new(config.event_capacity));
        let sequencer = IdentitySequencer::spawn_with_events(
            LocalLedger::starting_at(config.first_xid),
            config.sequencer_config(),
            Arc::clone(&events),
        );
        let broadcaster = SnapshotBroadcaster::spawn(
            events,
            config.heartbeat_interval,
            config.backlog_warn_bytes,
        );

        Self {
            config,
            sequencer,
            broadcaster,
            shutdown: CancellationToken::new(),
        }
    }

    pub const fn sequencer(&self) -> &IdentitySequencer {
        &self.sequencer
    }

    pub const fn broadcaster(&self) -> &SnapshotBroadcaster {
        &self.broadcaster
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections until [`Self::shutdown`] is called, then waits up
    /// to the configured shutdown timeout for open connections to finish.
    pub async fn serve(&self, listeners: Listeners) {
        let mut control = TcpListenerStream::new(listeners.control);
        let mut broadcast = TcpListenerStream::new(listeners.broadcast);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                accepted = control.next() => {
                    if let Some((socket, peer)) = with_peer(accepted, "Control") {
                        connections.spawn(self.clone().node_session(socket, peer));
                    }
                }
                accepted = broadcast.next() => {
                    if let Some((socket, peer)) = with_peer(accepted, "Broadcast") {
                        connections.spawn(self.clone().subscriber_session(socket, peer));
                    }
                }
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!("Connection task panicked: {e}");
                    }
                }
            }
        }

        drop(control);
        drop(broadcast);
        let open = connections.len();
        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(self.config.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(open, "Connections still open after shutdown timeout, aborting");
            connections.abort_all();
        }
    }

    async fn node_session(self, socket: TcpStream, peer: SocketAddr) {
        let config = SessionConfig {
            request_timeout: self.config.request_timeout,
            heartbeat_interval: self.config.heartbeat_interval,
            max_batch: self.config.max_batch_size,
        };
        let result = serve_node(
            socket,
            peer,
            self.sequencer.clone(),
            config,
            self.shutdown.clone(),
        )
        .await;
        match result {
            Ok(Some(node)) => {
                report_orphans(&self.sequencer, node, self.config.request_timeout).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(%peer, "Control session dropped: {e}"),
        }
    }

    async fn subscriber_session(self, socket: TcpStream, peer: SocketAddr) {
        let result = serve_subscriber(
            socket,
            peer,
            self.broadcaster.clone(),
            self.config.request_timeout,
            self.shutdown.clone(),
        )
        .await;
        if let Err(e) = result {
            increment_subscriber_drops();
            tracing::warn!(%peer, "Subscriber dropped: {e}");
        }
    }

    /// Text dump of the sequencer's pool and outstanding set followed by
    /// every subscriber's state.
    ///
    /// # Errors
    ///
    /// [`xidgate::Error::Timeout`] or [`xidgate::Error::ServiceShutdown`].
    pub async fn dump(&self) -> Result<String> {
        let sequencer = self.sequencer.dump().await?;
        let broadcaster = self.broadcaster.dump().await?;
        Ok(format!("{sequencer}\n{broadcaster}"))
    }

    /// Stops accepting, fails parked requests with
    /// [`xidgate::Error::ServiceShutdown`], and stops the fan-out loop once
    /// the sequencer has emitted its last event.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.sequencer.shutdown().await;
        self.broadcaster.shutdown().await;
    }
}

fn with_peer(
    accepted: Option<io::Result<TcpStream>>,
    kind: &str,
) -> Option<(TcpStream, SocketAddr)> {
    match accepted? {
        Ok(socket) => match socket.peer_addr() {
            Ok(peer) => {
                tracing::debug!(%peer, "{kind} connection accepted");
                Some((socket, peer))
            }
            Err(e) => {
                tracing::warn!("{kind} peer address unavailable: {e}");
                None
            }
        },
        Err(e) => {
            tracing::warn!("{kind} accept failed: {e}");
            None
        }
    }
}
