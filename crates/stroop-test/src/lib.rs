//! Stroop Test Harness - Two-device simulation and end-to-end scenarios
//!
//! This crate provides:
//! - Loopback device pairs over the in-memory transport
//! - Scripted peers that speak the wire protocol by hand
//! - A simulated subject answering stimuli
//! - Timed task, reconnection, silence and deferred-results scenarios

pub mod harness;
pub mod scenarios;

pub use harness::*;
pub use scenarios::*;
