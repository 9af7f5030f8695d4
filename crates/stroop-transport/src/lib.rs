//! Stroop Transport - Connection lifecycle between the two devices
//!
//! This crate implements:
//! - Discovery collaborators (static address, in-process registry)
//! - Stream sources (TCP, in-memory loopback)
//! - Handshake, heartbeat and silence detection
//! - Per-link reader/writer/heartbeat tasks with writer hand-back
//! - The connection manager with exponential reconnection backoff

pub mod backoff;
pub mod discovery;
pub mod handshake;
pub mod link;
pub mod manager;
pub mod memory;
pub mod net;
pub mod status;

pub use backoff::*;
pub use discovery::*;
pub use handshake::*;
pub use link::*;
pub use manager::*;
pub use memory::*;
pub use net::*;
pub use status::*;
