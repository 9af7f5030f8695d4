//! Stroop Task Engine - Trial and session state machines
//!
//! This crate implements:
//! - TaskExecution: Waiting → Countdown → {Display ⇄ Interval} → Completed
//! - SessionState: ordered task sequence with completion bookkeeping
//! - TaskRunner: drives one TaskExecution on its own clock, independent of
//!   connection health

pub mod execution;
pub mod runner;
pub mod session;

pub use execution::*;
pub use runner::*;
pub use session::*;
