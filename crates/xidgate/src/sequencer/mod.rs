mod config;
mod handle;
mod interface;
mod ledger;
mod request;
mod service;

pub use config::*;
pub use handle::*;
pub use interface::*;
pub use ledger::*;
