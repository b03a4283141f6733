use core::time::Duration;
use xidgate::{NodeId, SequencerConfig};

/// Settings for a node-side [`crate::SequencerClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane address of the authority.
    pub authority_addr: String,
    /// This node's id, recorded by the authority as owner of granted ids.
    pub node_id: NodeId,
    /// Default deadline for requests and upstream round trips.
    pub request_timeout: Duration,
    /// Ids to keep pre-fetched. `0` requests every id individually.
    pub pool_target: usize,
    /// How often to send a heartbeat on an idle link. The link is declared
    /// dead after three intervals without hearing from the authority.
    pub heartbeat_interval: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    /// How often the local pool is checked for replenishment.
    pub tick_interval: Duration,
    /// Capacity of the local request mailbox.
    pub mailbox_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            authority_addr: "127.0.0.1:6667".to_string(),
            node_id: 1,
            request_timeout: Duration::from_secs(5),
            pool_target: 64,
            heartbeat_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            tick_interval: Duration::from_millis(10),
            mailbox_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(authority_addr: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            authority_addr: authority_addr.into(),
            node_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub const fn with_pool_target(mut self, pool_target: usize) -> Self {
        self.pool_target = pool_target;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    #[must_use]
    pub const fn with_reconnect_interval(mut self, reconnect_interval: Duration) -> Self {
        self.reconnect_interval = reconnect_interval;
        self
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Local sequencer settings derived from this config.
    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig::default()
            .with_node_id(self.node_id)
            .with_pool_target(self.pool_target)
            .with_mailbox_capacity(self.mailbox_capacity)
            .with_tick_interval(self.tick_interval)
            .with_request_timeout(self.request_timeout)
    }
}
