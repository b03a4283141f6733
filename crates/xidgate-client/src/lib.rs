#![doc = include_str!("../README.md")]

mod client;
mod config;
mod subscriber;
mod upstream;

pub use crate::client::*;
pub use crate::config::*;
pub use crate::subscriber::*;
pub use crate::upstream::*;
