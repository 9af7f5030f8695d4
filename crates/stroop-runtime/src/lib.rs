//! Stroop Runtime - Composition root for both devices
//!
//! This crate wires the lower layers together:
//! - Configuration (JSON, humantime durations) and logging
//! - SessionController: initiator-side task sequencing
//! - DisplayNode: responder-side task execution and reporting
//! - StroopNode: builds either role from a `StroopConfig`

pub mod config;
pub mod controller;
pub mod display;
pub mod duration_format;
pub mod logging;
pub mod node;

pub use config::*;
pub use controller::*;
pub use display::*;
pub use logging::*;
pub use node::*;
