mod error;
mod frame;
mod types;

pub use error::*;
pub use frame::*;
pub use types::*;
