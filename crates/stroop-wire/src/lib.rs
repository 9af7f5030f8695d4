//! Stroop Wire Protocol - Framing and message codec
//!
//! This crate implements the device-to-device wire format:
//! - 4-byte big-endian length prefix + payload (max 1 MiB)
//! - Tagged JSON message union with a shared envelope
//! - Aggregated task results carried by `task_completed`

pub mod frame;
pub mod message;
pub mod results;

pub use frame::*;
pub use message::*;
pub use results::*;
