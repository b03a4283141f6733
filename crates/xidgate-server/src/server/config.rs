use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use xidgate::{NodeId, SequencerConfig, TransactionId};
use xidgate_proto::MAX_IDS_PER_FRAME;

/// Runtime configuration for the `xidgate-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a single
/// authority serving a handful of nodes.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "xidgate-server",
    version,
    about = "Transaction id authority and snapshot broadcaster"
)]
pub struct CliArgs {
    /// Control-plane listen address. Nodes request ids and report finishes
    /// here.
    ///
    /// Environment variable: `CONTROL_ADDR`
    #[arg(long, env = "CONTROL_ADDR", default_value_t = String::from("0.0.0.0:6667"))]
    pub control_addr: String,

    /// Snapshot broadcast listen address.
    ///
    /// Environment variable: `BROADCAST_ADDR`
    #[arg(long, env = "BROADCAST_ADDR", default_value_t = String::from("0.0.0.0:6668"))]
    pub broadcast_addr: String,

    /// Node id the authority records as owner of ids it allocates for
    /// itself.
    ///
    /// Environment variable: `NODE_ID`
    #[arg(long, env = "NODE_ID", default_value_t = 0)]
    pub node_id: NodeId,

    /// First transaction id the ledger hands out. Nothing is persisted, so a
    /// restarted authority starts over from here.
    ///
    /// Environment variable: `FIRST_XID`
    #[arg(long, env = "FIRST_XID", default_value_t = 3)]
    pub first_xid: u32,

    /// Ids the authority keeps pre-issued for grants and its own callers.
    ///
    /// Environment variable: `POOL_TARGET`
    #[arg(long, env = "POOL_TARGET", default_value_t = 4096)]
    pub pool_target: usize,

    /// Per-request deadline in milliseconds for grants and finishes.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// Idle interval in milliseconds after which a heartbeat is sent on
    /// control and broadcast connections. A control connection silent for
    /// three intervals is dropped.
    ///
    /// Environment variable: `HEARTBEAT_INTERVAL_MS`
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 1_000)]
    pub heartbeat_interval_ms: u64,

    /// Sequencer replenishment tick in milliseconds.
    ///
    /// Environment variable: `TICK_INTERVAL_MS`
    #[arg(long, env = "TICK_INTERVAL_MS", default_value_t = 10)]
    pub tick_interval_ms: u64,

    /// Most ids granted for one batch request. Larger requests are served
    /// up to this many.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 4096)]
    pub max_batch_size: usize,

    /// Capacity of the sequencer's request mailbox. Callers wait for room
    /// once it is full.
    ///
    /// Environment variable: `MAILBOX_CAPACITY`
    #[arg(long, env = "MAILBOX_CAPACITY", default_value_t = 1024)]
    pub mailbox_capacity: usize,

    /// Capacity of the mailbox between the sequencer and the broadcaster.
    ///
    /// Environment variable: `EVENT_CAPACITY`
    #[arg(long, env = "EVENT_CAPACITY", default_value_t = 4096)]
    pub event_capacity: usize,

    /// Outbound backlog in bytes above which a slow subscriber is logged.
    /// Backlogs are never truncated.
    ///
    /// Environment variable: `BACKLOG_WARN_BYTES`
    #[arg(long, env = "BACKLOG_WARN_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub backlog_warn_bytes: usize,

    /// Outstanding ids older than this many seconds are flagged in dumps.
    ///
    /// Environment variable: `LEAK_THRESHOLD_SECS`
    #[arg(long, env = "LEAK_THRESHOLD_SECS", default_value_t = 300)]
    pub leak_threshold_secs: u64,

    /// Seconds to wait for connections to drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub control_addr: String,
    pub broadcast_addr: String,
    pub node_id: NodeId,
    pub first_xid: TransactionId,
    pub pool_target: usize,
    pub max_batch_size: usize,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
    pub mailbox_capacity: usize,
    pub event_capacity: usize,
    pub backlog_warn_bytes: usize,
    pub leak_threshold: Duration,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let first_xid = TransactionId::from_raw(args.first_xid);
        if !first_xid.is_valid() {
            bail!("FIRST_XID must not be the invalid id 0");
        }

        if args.control_addr == args.broadcast_addr {
            bail!(
                "CONTROL_ADDR and BROADCAST_ADDR must differ (both are {})",
                args.control_addr
            );
        }

        if args.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than 0");
        }

        if args.heartbeat_interval_ms == 0 {
            bail!("HEARTBEAT_INTERVAL_MS must be greater than 0");
        }

        if args.tick_interval_ms == 0 {
            bail!("TICK_INTERVAL_MS must be greater than 0");
        }

        if args.mailbox_capacity == 0 || args.event_capacity == 0 {
            bail!("MAILBOX_CAPACITY and EVENT_CAPACITY must be greater than 0");
        }

        if args.max_batch_size == 0 || args.max_batch_size > MAX_IDS_PER_FRAME {
            bail!("MAX_BATCH_SIZE must be between 1 and {MAX_IDS_PER_FRAME}");
        }

        Ok(Self {
            control_addr: args.control_addr,
            broadcast_addr: args.broadcast_addr,
            node_id: args.node_id,
            first_xid,
            pool_target: args.pool_target,
            max_batch_size: args.max_batch_size,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            tick_interval: Duration::from_millis(args.tick_interval_ms),
            mailbox_capacity: args.mailbox_capacity,
            event_capacity: args.event_capacity,
            backlog_warn_bytes: args.backlog_warn_bytes,
            leak_threshold: Duration::from_secs(args.leak_threshold_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}

impl ServerConfig {
    /// Settings for the authority's own sequencer.
    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig::default()
            .with_node_id(self.node_id)
            .with_pool_target(self.pool_target)
            .with_mailbox_capacity(self.mailbox_capacity)
            .with_tick_interval(self.tick_interval)
            .with_request_timeout(self.request_timeout)
            .with_leak_threshold(self.leak_threshold)
    }

    /// A config for in-process use, listening on ephemeral loopback ports.
    pub fn loopback() -> Self {
        Self {
            control_addr: "127.0.0.1:0".to_string(),
            broadcast_addr: "127.0.0.1:0".to_string(),
            node_id: 0,
            first_xid: TransactionId::FIRST,
            pool_target: 64,
            max_batch_size: 4096,
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(10),
            mailbox_capacity: 1024,
            event_capacity: 1024,
            backlog_warn_bytes: 8 * 1024 * 1024,
            leak_threshold: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let mut argv = vec!["xidgate-server"];
        argv.extend_from_slice(extra);
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.first_xid, TransactionId::from_raw(3));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.sequencer_config().pool_target, 4096);
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(parse(&["--first-xid", "0"]).is_err());
        assert!(parse(&["--heartbeat-interval-ms", "0"]).is_err());
        assert!(parse(&["--broadcast-addr", "0.0.0.0:6667"]).is_err());
        assert!(parse(&["--event-capacity", "0"]).is_err());
        assert!(parse(&["--max-batch-size", "0"]).is_err());
        assert!(parse(&["--max-batch-size", "65537"]).is_err());
        assert_eq!(
            parse(&["--max-batch-size", "65536"]).unwrap().max_batch_size,
            MAX_IDS_PER_FRAME
        );
    }
}
