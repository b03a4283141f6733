//! Subscribes to an xidgate broadcaster and logs the bootstrap snapshot and
//! every delta that follows.

use clap::Parser;
use core::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use xidgate::SnapshotDelta;
use xidgate_client::{SnapshotSubscriber, SubscriberEvent};

#[derive(Parser, Debug)]
#[command(name = "xidgate-watch", version, about = "Stream xidgate snapshot deltas")]
struct WatchArgs {
    /// Broadcaster address.
    #[arg(long, env = "XIDGATE_BROADCAST_ADDR", default_value = "127.0.0.1:6668")]
    broadcast_addr: String,

    /// Connect and handshake timeout in milliseconds.
    #[arg(long, env = "XIDGATE_CONNECT_TIMEOUT_MS", default_value_t = 2_000)]
    connect_timeout_ms: u64,

    /// Report the consumed position every N deltas. 0 disables reports.
    #[arg(long, env = "XIDGATE_ACK_EVERY", default_value_t = 64)]
    ack_every: u64,

    /// Also log heartbeats.
    #[arg(long)]
    heartbeats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = WatchArgs::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .init();

    let limit = Duration::from_millis(args.connect_timeout_ms);
    let mut subscriber = SnapshotSubscriber::connect(&args.broadcast_addr, limit)
        .await?
        .with_ack_every(args.ack_every);
    tracing::info!(
        addr = %args.broadcast_addr,
        bootstrap = %subscriber.bootstrap(),
        "Streaming snapshot deltas"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => break,
            event = subscriber.next_event() => event?,
        };
        match event {
            Some(SubscriberEvent::Delta(SnapshotDelta::Assign(ids))) => {
                tracing::info!(?ids, running = subscriber.view().len(), "assign");
            }
            Some(SubscriberEvent::Delta(SnapshotDelta::Commit(ids))) => {
                tracing::info!(?ids, running = subscriber.view().len(), "commit");
            }
            Some(SubscriberEvent::Heartbeat) => {
                if args.heartbeats {
                    tracing::info!(running = subscriber.view().len(), "heartbeat");
                }
            }
            None => {
                tracing::warn!(anomalies = subscriber.anomalies(), "Broadcaster closed the stream");
                return Ok(());
            }
        }
    }

    tracing::info!("Stopping");
    let view = subscriber.stop().await?;
    tracing::info!(running = view.len(), xmax = %view.xmax(), "Stream closed");
    Ok(())
}
