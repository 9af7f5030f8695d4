//! Async task runner
//!
//! Drives one `TaskExecution` from tokio timers. The runner owns its own
//! clock: connection health never reaches it, only explicit commands do.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use stroop_core::{SessionClock, Stimulus, Task, TaskId, Timestamp};
use stroop_stimulus::StimulusGenerator;
use stroop_wire::{TaskOutcome, TaskPhase};

use crate::{InvalidTransition, TaskExecution};

/// Commands accepted by a running task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Response verdict for the stimulus on screen
    Verdict { correct: bool, responded_at: Timestamp },
    Pause,
    Resume,
    /// Explicit end; history kept
    End,
    /// Emergency stop
    Stop,
}

/// Last-value snapshot for the presentation layer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskExecutionUiState {
    pub task_id: Option<TaskId>,
    pub phase: TaskPhase,
    pub current_stimulus: Option<Stimulus>,
    pub stimuli_shown: u32,
    /// Timeout budget left
    pub remaining: Duration,
}

/// Runs task executions one at a time
pub struct TaskRunner {
    generator: StimulusGenerator,
    clock: SessionClock,
    ui: watch::Sender<TaskExecutionUiState>,
}

impl TaskRunner {
    pub fn new(generator: StimulusGenerator, clock: SessionClock) -> Self {
        let (ui, _) = watch::channel(TaskExecutionUiState::default());
        TaskRunner {
            generator,
            clock,
            ui,
        }
    }

    /// Subscribe to UI state updates
    pub fn subscribe(&self) -> watch::Receiver<TaskExecutionUiState> {
        self.ui.subscribe()
    }

    pub fn generator(&self) -> &StimulusGenerator {
        &self.generator
    }

    pub fn clock(&self) -> SessionClock {
        self.clock
    }

    /// Run `task` to completion and return the sealed execution
    ///
    /// A closed command channel is treated as an emergency stop.
    pub async fn run(
        &mut self,
        task: &Task,
        commands: &mut mpsc::Receiver<RunnerCommand>,
    ) -> TaskExecution {
        let mut exec = TaskExecution::new(task);
        let started = Instant::now();
        self.check(exec.start(self.clock.at(started)));
        self.publish(&exec, started);

        info!(
            task_id = %task.id,
            timeout_ms = task.timeout.as_millis() as u64,
            "Task started"
        );

        let countdown_end = started + self.generator.timing().countdown;
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(RunnerCommand::End) => {
                        return self.finish(exec, Instant::now(), TaskOutcome::Ended);
                    }
                    Some(RunnerCommand::Stop) | None => {
                        return self.finish(exec, Instant::now(), TaskOutcome::Stopped);
                    }
                    Some(other) => debug!(?other, "Ignoring command during countdown"),
                },
                _ = sleep_until(countdown_end) => break,
            }
        }

        self.check(exec.begin_cycling(self.clock.at(countdown_end)));

        let mut timeout_at = countdown_end + task.timeout;
        let mut paused_at: Option<Instant> = None;
        // First stimulus goes up as soon as the countdown ends
        let mut deadline = countdown_end;
        let mut interval_after = Duration::ZERO;
        self.publish(&exec, countdown_end);

        loop {
            let running = paused_at.is_none();
            tokio::select! {
                biased;
                _ = sleep_until(timeout_at), if running => {
                    return self.finish(exec, timeout_at, TaskOutcome::TimedOut);
                }
                command = commands.recv() => {
                    let now = Instant::now();
                    match command {
                        Some(RunnerCommand::Verdict { correct, responded_at }) => {
                            if exec.record_response(correct, responded_at) {
                                deadline = now + interval_after;
                                self.publish(&exec, now);
                            } else {
                                debug!(
                                    task_id = %task.id,
                                    phase = ?exec.phase(),
                                    "Verdict outside display ignored"
                                );
                            }
                        }
                        Some(RunnerCommand::Pause) => {
                            if running {
                                self.check(exec.pause(self.clock.at(now)));
                                paused_at = Some(now);
                                self.publish(&exec, now);
                                info!(task_id = %task.id, "Task paused");
                            }
                        }
                        Some(RunnerCommand::Resume) => {
                            if let Some(since) = paused_at.take() {
                                self.check(exec.resume(self.clock.at(now)));
                                timeout_at += now - since;
                                deadline = now + self.generator.sample_interval();
                                self.publish(&exec, now);
                                info!(task_id = %task.id, "Task resumed");
                            }
                        }
                        Some(RunnerCommand::End) => {
                            return self.finish(exec, now, TaskOutcome::Ended);
                        }
                        Some(RunnerCommand::Stop) | None => {
                            return self.finish(exec, now, TaskOutcome::Stopped);
                        }
                    }
                }
                _ = sleep_until(deadline), if running => {
                    match exec.phase() {
                        TaskPhase::Display => {
                            self.check(exec.end_display());
                            deadline += interval_after;
                        }
                        _ => {
                            let next = self.generator.generate();
                            self.check(exec.show(&next, self.clock.at(deadline)));
                            interval_after = next.interval;
                            deadline += next.display;
                        }
                    }
                    self.publish(&exec, Instant::now());
                }
            }
        }
    }

    fn finish(&self, mut exec: TaskExecution, at: Instant, outcome: TaskOutcome) -> TaskExecution {
        exec.complete(self.clock.at(at), outcome);
        self.publish(&exec, at);
        info!(
            task_id = %exec.task_id(),
            ?outcome,
            stimuli_shown = exec.stimuli_shown(),
            "Task completed"
        );
        exec
    }

    fn publish(&self, exec: &TaskExecution, now: Instant) {
        self.ui.send_replace(TaskExecutionUiState {
            task_id: Some(exec.task_id().clone()),
            phase: exec.phase(),
            current_stimulus: exec.current_stimulus().cloned(),
            stimuli_shown: exec.stimuli_shown(),
            remaining: exec.remaining(self.clock.at(now)),
        });
    }

    fn check(&self, result: Result<(), InvalidTransition>) {
        if let Err(e) = result {
            warn!("Task transition rejected: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stroop_stimulus::{ColorPalette, StimulusTiming};

    fn runner(seed: u64) -> TaskRunner {
        let generator =
            StimulusGenerator::with_seed(ColorPalette::standard(), StimulusTiming::default(), seed)
                .unwrap();
        TaskRunner::new(generator, SessionClock::with_origin(Timestamp::ZERO))
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_task_stimulus_count_tracks_cycle_length() {
        let mut runner = runner(42);
        let clock = runner.clock();
        let mut ui = runner.subscribe();
        let task = Task::new("long", "Three minutes", Duration::from_secs(180));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(async move { runner.run(&task, &mut rx).await });

        // Subject answers every stimulus 500 ms after it appears
        let mut answered = 0;
        while let Ok(state) = ui
            .wait_for(move |s| s.phase == TaskPhase::Display && s.stimuli_shown > answered)
            .await
        {
            answered = state.stimuli_shown;
            drop(state);
            tokio::time::sleep(Duration::from_millis(500)).await;
            let verdict = RunnerCommand::Verdict {
                correct: true,
                responded_at: clock.now(),
            };
            if tx.send(verdict).await.is_err() {
                break;
            }
        }

        let exec = handle.await.unwrap();
        assert_eq!(exec.outcome(), Some(TaskOutcome::TimedOut));
        let shown = exec.stimuli_shown();
        assert!((45..=90).contains(&shown), "shown {shown}");

        let results = exec.results().unwrap();
        // 3 s countdown + 180 s timeout
        assert_eq!(results.ended_at - results.started_at, Duration::from_secs(183));
        for displayed in &results.stimuli {
            assert_eq!(displayed.display_ms, 2000);
            assert!((1000..=3000).contains(&displayed.interval_ms));
            assert!(displayed.shown_at < results.ended_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_countdown_reports_full_completion() {
        let mut runner = runner(1);
        let task = Task::new("short", "Short", Duration::from_secs(30));
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(RunnerCommand::End).await.unwrap();

        let exec = runner.run(&task, &mut rx).await;
        let results = exec.results().unwrap();

        assert_eq!(results.outcome, TaskOutcome::Ended);
        assert_eq!(results.stimuli_shown, 0);
        assert_eq!(results.completion_rate, 100.0);
        assert_eq!(results.average_reaction_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verdict_ends_display_early() {
        let mut runner = runner(3);
        let clock = runner.clock();
        let mut ui = runner.subscribe();
        let task = Task::new("t1", "Trial", Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(async move { runner.run(&task, &mut rx).await });

        ui.wait_for(|s| s.phase == TaskPhase::Display).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(RunnerCommand::Verdict {
            correct: true,
            responded_at: clock.now(),
        })
        .await
        .unwrap();

        ui.wait_for(|s| s.phase == TaskPhase::Interval).await.unwrap();
        tx.send(RunnerCommand::Stop).await.unwrap();

        let exec = handle.await.unwrap();
        assert_eq!(exec.outcome(), Some(TaskOutcome::Stopped));
        assert_eq!(exec.stimuli_shown(), 1);

        let first = &exec.displayed_stimuli()[0];
        assert!(first.response.unwrap().correct);
        assert_eq!(first.reaction_time(), Some(Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_timeout_clock() {
        let mut runner = runner(5);
        let mut ui = runner.subscribe();
        let task = Task::new("t1", "Trial", Duration::from_secs(10));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = tokio::spawn(async move { runner.run(&task, &mut rx).await });

        ui.wait_for(|s| s.phase == TaskPhase::Display).await.unwrap();
        tx.send(RunnerCommand::Pause).await.unwrap();
        ui.wait_for(|s| s.phase == TaskPhase::Paused).await.unwrap();
        assert!(ui.borrow().current_stimulus.is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ui.borrow().phase, TaskPhase::Paused);
        assert_eq!(ui.borrow().stimuli_shown, 1);
        tx.send(RunnerCommand::Resume).await.unwrap();

        let exec = handle.await.unwrap();
        assert_eq!(exec.outcome(), Some(TaskOutcome::TimedOut));
        let results = exec.results().unwrap();
        // countdown + pause + timeout
        assert_eq!(results.ended_at - results.started_at, Duration::from_secs(73));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_command_channel_stops_task() {
        let mut runner = runner(8);
        let task = Task::new("t1", "Trial", Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel::<RunnerCommand>(1);
        drop(tx);

        let exec = runner.run(&task, &mut rx).await;
        assert_eq!(exec.outcome(), Some(TaskOutcome::Stopped));
    }
}
