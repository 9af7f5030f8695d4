//! Task outcome and aggregated results
//!
//! These travel inside `task_completed` and are also what the persistence
//! collaborator stores.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stroop_core::{Stimulus, TaskId, Timestamp};

/// How a task execution ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Task timeout elapsed
    TimedOut,
    /// Ended by an explicit `end_task`
    Ended,
    /// Emergency stop or reset
    Stopped,
}

/// Phase of a task execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    Waiting,
    Countdown,
    Display,
    Interval,
    Paused,
    Completed,
}

impl TaskPhase {
    /// Stimulus cycling phases (timeout clock running)
    pub fn is_cycling(self) -> bool {
        matches!(self, TaskPhase::Display | TaskPhase::Interval)
    }
}

/// Verdict supplied by the response subsystem for one stimulus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusResponse {
    pub correct: bool,
    pub responded_at: Timestamp,
}

/// One stimulus as it was shown
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayedStimulus {
    pub stimulus: Stimulus,
    pub shown_at: Timestamp,
    pub display_ms: u64,
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<StimulusResponse>,
}

impl DisplayedStimulus {
    pub fn new(stimulus: Stimulus, shown_at: Timestamp, display: Duration, interval: Duration) -> Self {
        DisplayedStimulus {
            stimulus,
            shown_at,
            display_ms: display.as_millis() as u64,
            interval_ms: interval.as_millis() as u64,
            response: None,
        }
    }

    /// Time from display to response, if a response was recorded
    pub fn reaction_time(&self) -> Option<Duration> {
        self.response.map(|r| r.responded_at - self.shown_at)
    }
}

/// Aggregated results of one task execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResults {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub stimuli_shown: u32,
    pub responses: u32,
    pub correct_responses: u32,
    /// Percentage of shown stimuli that received a response
    pub completion_rate: f64,
    pub average_reaction_ms: f64,
    #[serde(default)]
    pub stimuli: Vec<DisplayedStimulus>,
}

impl TaskResults {
    /// Aggregate a stimulus history
    ///
    /// With no stimuli shown the completion rate is 100% and the average
    /// reaction time is 0; with no responses the average is 0.
    pub fn aggregate(
        task_id: TaskId,
        outcome: TaskOutcome,
        started_at: Timestamp,
        ended_at: Timestamp,
        stimuli: Vec<DisplayedStimulus>,
    ) -> Self {
        let shown = stimuli.len() as u32;
        let mut responses = 0u32;
        let mut correct = 0u32;
        let mut reaction_total_ms = 0u64;

        for displayed in &stimuli {
            if let Some(response) = displayed.response {
                responses += 1;
                if response.correct {
                    correct += 1;
                }
                reaction_total_ms += (response.responded_at - displayed.shown_at).as_millis() as u64;
            }
        }

        let completion_rate = if shown == 0 {
            100.0
        } else {
            responses as f64 * 100.0 / shown as f64
        };
        let average_reaction_ms = if responses == 0 {
            0.0
        } else {
            reaction_total_ms as f64 / responses as f64
        };

        TaskResults {
            task_id,
            outcome,
            started_at,
            ended_at,
            stimuli_shown: shown,
            responses,
            correct_responses: correct,
            completion_rate,
            average_reaction_ms,
            stimuli,
        }
    }

    /// Share of responses that were correct (0 when there were none)
    pub fn accuracy(&self) -> f64 {
        if self.responses == 0 {
            0.0
        } else {
            self.correct_responses as f64 / self.responses as f64
        }
    }
}
