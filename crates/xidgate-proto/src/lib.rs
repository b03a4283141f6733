#![doc = include_str!("../README.md")]

mod common;
mod control;
mod stream;

pub use common::*;
pub use control::*;
pub use stream::*;
// Public re-export so downstream crates can reach the core types via
// `xidgate_proto::xidgate`
pub use xidgate;
