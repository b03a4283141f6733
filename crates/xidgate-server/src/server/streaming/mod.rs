//! Snapshot broadcast.
//!
//! - [`coordinator`] - the fan-out loop that mirrors the running set and
//!   pushes serialized deltas to every streaming subscriber.
//! - [`subscriber`] - one task per subscriber connection.

pub mod coordinator;
pub mod subscriber;
