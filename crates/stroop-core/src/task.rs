//! Task definitions
//!
//! Tasks come from configuration and never change once loaded.

use std::time::Duration;

use crate::TaskId;

/// One timed trial as defined by the task catalog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    /// Catalog identifier
    pub id: TaskId,
    /// Human-readable label
    pub label: String,
    /// Time allowed once the countdown has elapsed
    pub timeout: Duration,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, label: impl Into<String>, timeout: Duration) -> Self {
        Task {
            id: id.into(),
            label: label.into(),
            timeout,
        }
    }
}
