//! Session state machine
//!
//! Tracks progress through an ordered list of unique tasks.
//! INVARIANT: current_index ∈ [0, task_ids.len()]

use std::collections::BTreeSet;

use stroop_core::{SessionError, TaskId};

/// Progress through a task sequence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    task_ids: Vec<TaskId>,
    current_index: usize,
    completed: BTreeSet<usize>,
    is_session_complete: bool,
}

impl SessionState {
    /// Create a session over a non-empty sequence of unique task ids
    pub fn new(task_ids: Vec<TaskId>) -> Result<Self, SessionError> {
        if task_ids.is_empty() {
            return Err(SessionError::EmptySequence);
        }
        let mut seen = BTreeSet::new();
        for id in &task_ids {
            if !seen.insert(id) {
                return Err(SessionError::DuplicateTask(id.clone()));
            }
        }
        Ok(SessionState {
            task_ids,
            current_index: 0,
            completed: BTreeSet::new(),
            is_session_complete: false,
        })
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_task_id(&self) -> Option<&TaskId> {
        self.task_ids.get(self.current_index)
    }

    pub fn has_next_task(&self) -> bool {
        self.current_index + 1 < self.task_ids.len()
    }

    /// Advance to the next task; leaves the state untouched if there is none
    pub fn move_to_next_task(&mut self) -> Result<&TaskId, SessionError> {
        if !self.has_next_task() {
            return Err(SessionError::NoNextTask);
        }
        self.current_index += 1;
        Ok(&self.task_ids[self.current_index])
    }

    /// Mark the current task completed
    ///
    /// Returns true if the task was not already completed.
    pub fn complete_current_task(&mut self) -> Result<bool, SessionError> {
        if self.current_index >= self.task_ids.len() {
            return Err(SessionError::SessionComplete);
        }
        let inserted = self.completed.insert(self.current_index);
        self.recompute();
        Ok(inserted)
    }

    /// Un-complete the current task without moving
    ///
    /// Returns true if the task had been completed.
    pub fn restart_current_task(&mut self) -> bool {
        let removed = self.completed.remove(&self.current_index);
        self.recompute();
        removed
    }

    /// Back to the first task with nothing completed
    pub fn reset_session(&mut self) {
        self.current_index = 0;
        self.completed.clear();
        self.recompute();
    }

    /// Jump to a specific task in the sequence
    pub fn select_task(&mut self, task_id: &TaskId) -> Result<(), SessionError> {
        let index = self
            .task_ids
            .iter()
            .position(|id| id == task_id)
            .ok_or_else(|| SessionError::UnknownTask(task_id.clone()))?;
        self.current_index = index;
        Ok(())
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    pub fn is_task_completed(&self, task_id: &TaskId) -> bool {
        self.task_ids
            .iter()
            .position(|id| id == task_id)
            .is_some_and(|index| self.is_completed(index))
    }

    pub fn completed_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.completed.iter().copied()
    }

    pub fn is_session_complete(&self) -> bool {
        self.is_session_complete
    }

    /// (completed, total)
    pub fn progress(&self) -> (usize, usize) {
        (self.completed.len(), self.task_ids.len())
    }

    fn recompute(&mut self) {
        self.is_session_complete = self.completed.len() >= self.task_ids.len();
    }
}
