//! Stroop Core - Fundamental types and primitives
//!
//! This crate defines the types shared by both devices of a Stroop session:
//! - Identifiers (SessionId, DeviceId, TaskId)
//! - Time primitives (Timestamp, SessionClock)
//! - Task definitions
//! - The Stroop stimulus and its non-congruence invariant
//! - The error taxonomy

pub mod error;
pub mod id;
pub mod stimulus;
pub mod task;
pub mod time;

pub use error::*;
pub use id::*;
pub use stimulus::*;
pub use task::*;
pub use time::*;
