//! Control-plane service.
//!
//! - [`handler`] - [`handler::AuthorityService`], which owns the sequencer
//!   and the broadcaster and runs both accept loops.
//! - [`session`] - one task per connected node.

pub mod handler;
pub mod session;
