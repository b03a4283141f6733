//! Error types for transaction id sequencing.
//!
//! ## Error Cases
//! - `Protocol`: a malformed or unexpected frame. Fatal to the connection that
//!   produced it, never to the process.
//! - `UpstreamUnavailable`: the authority link is not streaming-ready. New
//!   allocations fail fast; finishes degrade to a logged no-op.
//! - `Timeout`: a bounded wait elapsed. Fatal to the caller's transaction.
//! - `StaleCompletion`: a finish for an id the current sequencer generation
//!   does not know about. Logged and treated as success.
//! - `CapacityExceeded`: a bounded mailbox is full. Surfaced only through a
//!   non-blocking push; blocking pushes wait instead.
//! - `ChannelError`: internal task communication failed.
//! - `ServiceShutdown`: a request arrived while the sequencer was stopping.

use crate::TransactionId;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the sequencing layer.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A frame could not be decoded or arrived in the wrong state.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// The authority link is down or not yet streaming.
    #[error("Upstream unavailable: {context}")]
    UpstreamUnavailable { context: String },

    /// The caller's deadline elapsed before the request completed.
    #[error("Request timed out")]
    Timeout,

    /// The id was not outstanding in the current generation.
    #[error("Stale completion for {xid}")]
    StaleCompletion { xid: TransactionId },

    /// A bounded mailbox is at capacity.
    #[error("Mailbox at capacity ({capacity})")]
    CapacityExceeded { capacity: usize },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The sequencer is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Shorthand for [`Error::UpstreamUnavailable`].
    pub fn upstream(context: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            context: context.into(),
        }
    }

    /// Returns `true` for errors that must abort the caller's transaction when
    /// they occur on the allocate path.
    pub const fn is_transaction_fatal(&self) -> bool {
        !matches!(self, Self::StaleCompletion { .. })
    }
}
