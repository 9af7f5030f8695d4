//! Task execution state machine
//!
//! Pure bookkeeping: every transition takes the current timestamp from the
//! caller. The async runner owns the only instance and drives it.

use std::time::Duration;

use thiserror::Error;

use stroop_core::{Stimulus, Task, TaskId, Timestamp};
use stroop_stimulus::GeneratedStimulus;
use stroop_wire::{DisplayedStimulus, StimulusResponse, TaskOutcome, TaskPhase, TaskResults};

/// Transition attempted from a phase that does not allow it
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot {action} while {phase:?}")]
pub struct InvalidTransition {
    pub phase: TaskPhase,
    pub action: &'static str,
}

/// One timed trial
#[derive(Clone, Debug)]
pub struct TaskExecution {
    task_id: TaskId,
    timeout: Duration,
    start_time: Option<Timestamp>,
    end_time: Option<Timestamp>,
    phase: TaskPhase,
    outcome: Option<TaskOutcome>,
    /// Append-only stimulus history
    displayed: Vec<DisplayedStimulus>,
    /// Index into `displayed` while a stimulus is on screen
    current: Option<usize>,
    /// Start of the current active (cycling) stretch
    active_since: Option<Timestamp>,
    /// Active time accumulated before the last pause
    active_before: Duration,
}

impl TaskExecution {
    pub fn new(task: &Task) -> Self {
        TaskExecution {
            task_id: task.id.clone(),
            timeout: task.timeout,
            start_time: None,
            end_time: None,
            phase: TaskPhase::Waiting,
            outcome: None,
            displayed: Vec::new(),
            current: None,
            active_since: None,
            active_before: Duration::ZERO,
        }
    }

    fn guard(&self, allowed: bool, action: &'static str) -> Result<(), InvalidTransition> {
        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                phase: self.phase,
                action,
            })
        }
    }

    /// Waiting → Countdown
    pub fn start(&mut self, now: Timestamp) -> Result<(), InvalidTransition> {
        self.guard(self.phase == TaskPhase::Waiting, "start")?;
        self.start_time = Some(now);
        self.phase = TaskPhase::Countdown;
        Ok(())
    }

    /// Countdown → Interval; the timeout clock starts here
    pub fn begin_cycling(&mut self, now: Timestamp) -> Result<(), InvalidTransition> {
        self.guard(self.phase == TaskPhase::Countdown, "begin cycling")?;
        self.active_since = Some(now);
        self.phase = TaskPhase::Interval;
        Ok(())
    }

    /// Interval → Display, appending the stimulus to the history
    pub fn show(
        &mut self,
        generated: &GeneratedStimulus,
        now: Timestamp,
    ) -> Result<(), InvalidTransition> {
        self.guard(self.phase == TaskPhase::Interval, "show a stimulus")?;
        self.displayed.push(DisplayedStimulus::new(
            generated.stimulus.clone(),
            now,
            generated.display,
            generated.interval,
        ));
        self.current = Some(self.displayed.len() - 1);
        self.phase = TaskPhase::Display;
        Ok(())
    }

    /// Display → Interval once the display time has run out
    pub fn end_display(&mut self) -> Result<(), InvalidTransition> {
        self.guard(self.phase == TaskPhase::Display, "end display")?;
        self.current = None;
        self.phase = TaskPhase::Interval;
        Ok(())
    }

    /// Attach a verdict to the stimulus on screen and end its display early
    ///
    /// Returns false (and changes nothing) when no stimulus is on screen.
    pub fn record_response(&mut self, correct: bool, responded_at: Timestamp) -> bool {
        let Some(index) = self.current.filter(|_| self.phase == TaskPhase::Display) else {
            return false;
        };
        self.displayed[index].response = Some(StimulusResponse {
            correct,
            responded_at,
        });
        self.current = None;
        self.phase = TaskPhase::Interval;
        true
    }

    /// Display/Interval → Paused; stops the timeout clock
    pub fn pause(&mut self, now: Timestamp) -> Result<(), InvalidTransition> {
        self.guard(self.phase.is_cycling(), "pause")?;
        if let Some(since) = self.active_since.take() {
            self.active_before += now - since;
        }
        self.current = None;
        self.phase = TaskPhase::Paused;
        Ok(())
    }

    /// Paused → Interval; restarts the timeout clock
    pub fn resume(&mut self, now: Timestamp) -> Result<(), InvalidTransition> {
        self.guard(self.phase == TaskPhase::Paused, "resume")?;
        self.active_since = Some(now);
        self.phase = TaskPhase::Interval;
        Ok(())
    }

    /// Seal the execution
    ///
    /// Allowed from any phase; returns false if already completed. The
    /// stimulus history is kept.
    pub fn complete(&mut self, end_time: Timestamp, outcome: TaskOutcome) -> bool {
        if self.is_completed() {
            return false;
        }
        if let Some(since) = self.active_since.take() {
            self.active_before += end_time - since;
        }
        self.end_time = Some(end_time);
        self.outcome = Some(outcome);
        self.current = None;
        self.phase = TaskPhase::Completed;
        true
    }

    /// Drop the stimulus history (reset semantics)
    pub fn discard_history(&mut self) {
        self.displayed.clear();
        self.current = None;
    }

    /// Active (timeout-counted) time as of `now`
    pub fn elapsed(&self, now: Timestamp) -> Duration {
        match self.active_since {
            Some(since) => self.active_before + (now - since),
            None => self.active_before,
        }
    }

    /// Timeout budget left as of `now`
    pub fn remaining(&self, now: Timestamp) -> Duration {
        self.timeout.saturating_sub(self.elapsed(now))
    }

    /// Active AND elapsed >= timeout
    pub fn has_timed_out(&self, now: Timestamp) -> bool {
        self.is_active() && self.elapsed(now) >= self.timeout
    }

    /// Stimulus cycling with the timeout clock running
    pub fn is_active(&self) -> bool {
        self.phase.is_cycling()
    }

    pub fn is_completed(&self) -> bool {
        self.phase == TaskPhase::Completed
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome
    }

    pub fn start_time(&self) -> Option<Timestamp> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<Timestamp> {
        self.end_time
    }

    pub fn current_stimulus(&self) -> Option<&Stimulus> {
        self.current.map(|index| &self.displayed[index].stimulus)
    }

    pub fn displayed_stimuli(&self) -> &[DisplayedStimulus] {
        &self.displayed
    }

    pub fn stimuli_shown(&self) -> u32 {
        self.displayed.len() as u32
    }

    /// Aggregated results; `None` until the execution is sealed
    pub fn results(&self) -> Option<TaskResults> {
        let (end_time, outcome) = (self.end_time?, self.outcome?);
        Some(TaskResults::aggregate(
            self.task_id.clone(),
            outcome,
            self.start_time.unwrap_or(end_time),
            end_time,
            self.displayed.clone(),
        ))
    }
}
