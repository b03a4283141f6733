//! The authority process.
//!
//! ## Structure
//!
//! - [`config`] - CLI and environment settings.
//! - [`service`] - the authority handle and control-plane sessions.
//! - [`streaming`] - snapshot fan-out to subscribers.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod service;
pub mod streaming;
pub mod telemetry;
