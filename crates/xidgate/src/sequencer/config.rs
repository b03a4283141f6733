use crate::NodeId;
use core::time::Duration;

/// Tuning for an [`crate::IdentitySequencer`].
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Node recorded as the owner of ids handed out by [`crate::IdentitySequencer::allocate`].
    pub node_id: NodeId,
    /// Number of ids to keep pre-allocated. `0` disables the pool and sends
    /// every allocation upstream individually.
    pub pool_target: usize,
    /// Capacity of the request mailbox. Callers wait for a free slot once it
    /// fills up.
    pub mailbox_capacity: usize,
    /// How often the pool is checked for replenishment.
    pub tick_interval: Duration,
    /// Deadline applied to requests that do not take one explicitly.
    pub request_timeout: Duration,
    /// Outstanding ids older than this are flagged in diagnostics dumps.
    pub leak_threshold: Duration,
    /// Capacity of the channel carrying upstream replies back to the loop.
    pub internal_channel_size: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            pool_target: 64,
            mailbox_capacity: 1024,
            tick_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            leak_threshold: Duration::from_secs(300),
            internal_channel_size: 256,
        }
    }
}

impl SequencerConfig {
    #[must_use]
    pub const fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    #[must_use]
    pub const fn with_pool_target(mut self, pool_target: usize) -> Self {
        self.pool_target = pool_target;
        self
    }

    #[must_use]
    pub const fn with_mailbox_capacity(mut self, mailbox_capacity: usize) -> Self {
        self.mailbox_capacity = mailbox_capacity;
        self
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub const fn with_leak_threshold(mut self, leak_threshold: Duration) -> Self {
        self.leak_threshold = leak_threshold;
        self
    }
}
