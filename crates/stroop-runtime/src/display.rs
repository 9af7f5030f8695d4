//! Display node (responder side)
//!
//! Executes the tasks the initiator asks for. At most one task runs at a
//! time on its own spawned task; the node forwards verdicts to it, reports
//! its status while the link is up and, once it is sealed, queues the
//! results for the initiator and hands the execution to persistence.
//!
//! Link loss does not reach the running task. `task_completed` waits in
//! the outbound queue until the connection is back, and stays pending here
//! until the initiator answers with `results_received`: a write can succeed
//! on a link that is already dead, so every new link gets another copy.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use stroop_core::{SessionClock, SessionId, Task, TaskId};
use stroop_task::{RunnerCommand, TaskExecution, TaskExecutionUiState, TaskRunner};
use stroop_transport::{ConnectionStatus, Inbound, MessageSender};
use stroop_wire::{ErrorCode, Message, MessageBody, StimulusResponse, TaskOutcome, TaskResults};

const RUNNER_COMMAND_CAPACITY: usize = 16;
const VERDICT_CAPACITY: usize = 16;
const EXECUTION_CAPACITY: usize = 16;

/// Collaborator ends of a display node
pub struct DisplayHandles {
    /// Response verdicts for the stimulus on screen
    pub verdicts: mpsc::Sender<StimulusResponse>,
    /// Presentation state of the running task
    pub ui: watch::Receiver<TaskExecutionUiState>,
    /// Sealed executions for persistence (resets excluded)
    pub executions: mpsc::Receiver<TaskExecution>,
    /// Runner clock; verdict timestamps must come from it
    pub clock: SessionClock,
}

struct ActiveTask {
    task_id: TaskId,
    commands: mpsc::Sender<RunnerCommand>,
    /// Reset requested: discard history, report nothing
    reset: bool,
    handle: JoinHandle<(TaskRunner, TaskExecution)>,
}

/// Results the initiator has not acknowledged yet
struct PendingResults {
    results: TaskResults,
    session_id: SessionId,
    /// Link the latest copy goes out on
    link: u64,
}

/// Responder-side task executor
pub struct DisplayNode {
    /// `None` while a task holds it, or after a runner task failed
    runner: Option<TaskRunner>,
    sender: MessageSender,
    inbound: Inbound,
    verdicts: mpsc::Receiver<StimulusResponse>,
    executions: mpsc::Sender<TaskExecution>,
    ui: watch::Receiver<TaskExecutionUiState>,
    connection: watch::Receiver<ConnectionStatus>,
    status_interval: Duration,
    active: Option<ActiveTask>,
    pending: Vec<PendingResults>,
}

impl DisplayNode {
    pub fn new(
        runner: TaskRunner,
        sender: MessageSender,
        inbound: Inbound,
        status_interval: Duration,
    ) -> (Self, DisplayHandles) {
        let (verdict_tx, verdict_rx) = mpsc::channel(VERDICT_CAPACITY);
        let (execution_tx, execution_rx) = mpsc::channel(EXECUTION_CAPACITY);
        let handles = DisplayHandles {
            verdicts: verdict_tx,
            ui: runner.subscribe(),
            executions: execution_rx,
            clock: runner.clock(),
        };
        let node = DisplayNode {
            ui: runner.subscribe(),
            runner: Some(runner),
            connection: sender.status(),
            sender,
            inbound,
            verdicts: verdict_rx,
            executions: execution_tx,
            status_interval,
            active: None,
            pending: Vec::new(),
        };
        (node, handles)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve until the inbound stream ends; a running task is then stopped
    pub async fn run(mut self) {
        let mut status = tokio::time::interval(self.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status.tick().await;

        loop {
            tokio::select! {
                message = self.inbound.recv() => match message {
                    Some(message) => self.handle_command(message).await,
                    None => break,
                },
                Some(verdict) = self.verdicts.recv() => self.forward_verdict(verdict).await,
                joined = join_active(&mut self.active) => self.finish(joined).await,
                _ = status.tick() => self.report_status().await,
                Ok(()) = self.connection.changed() => self.resend_pending().await,
            }
        }

        if let Some(active) = &self.active {
            info!(task_id = %active.task_id, "Stopping task on shutdown");
            let _ = active.commands.send(RunnerCommand::Stop).await;
            let joined = join_active(&mut self.active).await;
            self.finish(joined).await;
        }
        debug!("Display node stopped");
    }

    async fn handle_command(&mut self, message: Message) {
        match message.body {
            MessageBody::StartTask {
                task_id,
                label,
                timeout_ms,
            } => {
                let task = Task::new(task_id, label, Duration::from_millis(timeout_ms));
                self.start_task(task).await
            }
            MessageBody::EndTask { task_id } => {
                self.command_task(&task_id, RunnerCommand::End).await
            }
            MessageBody::PauseTask { task_id } => {
                self.command_task(&task_id, RunnerCommand::Pause).await
            }
            MessageBody::ResumeTask { task_id } => {
                self.command_task(&task_id, RunnerCommand::Resume).await
            }
            MessageBody::ResetTask { task_id } => self.reset_task(&task_id).await,
            MessageBody::ResultsReceived { task_id } => {
                debug!(task_id = %task_id, "Results acknowledged");
                self.drop_pending(&task_id);
            }
            other => warn!(kind = %other.kind(), "Unexpected message for display node"),
        }
    }

    async fn start_task(&mut self, task: Task) {
        if let Some(active) = &self.active {
            let message = format!("task {} is already running", active.task_id);
            self.send_error(ErrorCode::TaskAlreadyRunning, message).await;
            return;
        }
        if task.timeout.is_zero() {
            let message = format!("task {} has a zero timeout", task.id);
            self.send_error(ErrorCode::Malformed, message).await;
            return;
        }
        let Some(mut runner) = self.runner.take() else {
            self.send_error(ErrorCode::NotReady, "task runner unavailable".into()).await;
            return;
        };

        let task_id = task.id.clone();
        // A new run supersedes results of the previous one
        self.drop_pending(&task_id);
        let (commands, mut rx) = mpsc::channel(RUNNER_COMMAND_CAPACITY);
        let handle = tokio::spawn(async move {
            let execution = runner.run(&task, &mut rx).await;
            (runner, execution)
        });
        self.active = Some(ActiveTask {
            task_id: task_id.clone(),
            commands,
            reset: false,
            handle,
        });

        info!(task_id = %task_id, session_id = %self.sender.session_id(), "Task accepted");
        self.send(MessageBody::StroopStarted { task_id }).await;
    }

    async fn command_task(&mut self, task_id: &TaskId, command: RunnerCommand) {
        match &self.active {
            Some(active) if active.task_id == *task_id => {
                // Closed means the task just sealed; its result is on the way
                let _ = active.commands.send(command).await;
            }
            _ => {
                let message = format!("task {} is not running", task_id);
                self.send_error(ErrorCode::UnknownTask, message).await;
            }
        }
    }

    async fn reset_task(&mut self, task_id: &TaskId) {
        match &mut self.active {
            Some(active) if active.task_id == *task_id => {
                active.reset = true;
                let _ = active.commands.send(RunnerCommand::Stop).await;
                info!(task_id = %task_id, "Task reset");
            }
            _ => {
                debug!(task_id = %task_id, "Reset for idle task");
                self.drop_pending(task_id);
            }
        }
    }

    async fn forward_verdict(&mut self, verdict: StimulusResponse) {
        match &self.active {
            Some(active) => {
                let command = RunnerCommand::Verdict {
                    correct: verdict.correct,
                    responded_at: verdict.responded_at,
                };
                let _ = active.commands.send(command).await;
            }
            None => debug!("Verdict with no running task ignored"),
        }
    }

    async fn finish(&mut self, joined: Result<(TaskRunner, TaskExecution), JoinError>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let mut execution = match joined {
            Ok((runner, execution)) => {
                self.runner = Some(runner);
                execution
            }
            Err(e) => {
                warn!(task_id = %active.task_id, "Task runner failed: {}", e);
                return;
            }
        };

        let outcome = execution.outcome().unwrap_or(TaskOutcome::Stopped);
        self.send(MessageBody::StroopEnded {
            task_id: active.task_id.clone(),
            outcome,
        })
        .await;

        if active.reset {
            execution.discard_history();
            debug!(task_id = %active.task_id, "Reset execution discarded");
            return;
        }

        if let Some(results) = execution.results() {
            info!(
                task_id = %active.task_id,
                ?outcome,
                stimuli_shown = results.stimuli_shown,
                connected = self.sender.is_connected(),
                "Queueing task results"
            );
            self.send(MessageBody::TaskCompleted {
                results: results.clone(),
            })
            .await;
            self.keep_pending(results);
        }
        if self.executions.send(execution).await.is_err() {
            debug!(task_id = %active.task_id, "No persistence consumer");
        }
    }

    async fn report_status(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        // Stale status is worthless after a reconnection
        if !self.sender.is_connected() {
            return;
        }
        let runner_ui = self.ui.borrow().clone();
        let body = MessageBody::TaskStatus {
            task_id: active.task_id.clone(),
            phase: runner_ui.phase,
            stimuli_shown: runner_ui.stimuli_shown,
            remaining_ms: runner_ui.remaining.as_millis() as u64,
        };
        self.send(body).await;
    }

    fn keep_pending(&mut self, results: TaskResults) {
        let (link, session_id) = {
            let status = self.connection.borrow();
            // Queued while down, the copy goes out on the next link
            let link = if status.is_connected() {
                status.links
            } else {
                status.links + 1
            };
            (link, status.session_id)
        };

        self.drop_pending(&results.task_id);
        self.pending.push(PendingResults {
            results,
            session_id,
            link,
        });
    }

    fn drop_pending(&mut self, task_id: &TaskId) {
        self.pending.retain(|p| p.results.task_id != *task_id);
    }

    /// Queue another copy of unacknowledged results on a new link
    async fn resend_pending(&mut self) {
        let (connected, links, session_id) = {
            let status = self.connection.borrow_and_update();
            (status.is_connected(), status.links, status.session_id)
        };
        if !connected || self.pending.is_empty() {
            return;
        }

        self.pending.retain(|p| {
            let same = p.session_id == session_id;
            if !same {
                debug!(task_id = %p.results.task_id, "Results of a previous session dropped");
            }
            same
        });
        let mut resend = Vec::new();
        for pending in self.pending.iter_mut().filter(|p| p.link < links) {
            pending.link = links;
            resend.push(pending.results.clone());
        }
        for results in resend {
            info!(task_id = %results.task_id, link = links, "Resending unacknowledged results");
            self.send(MessageBody::TaskCompleted { results }).await;
        }
    }

    async fn send_error(&self, code: ErrorCode, message: String) {
        warn!(?code, error = %message, "Rejecting command");
        self.send(MessageBody::Error { code, message }).await;
    }

    async fn send(&self, body: MessageBody) {
        let kind = body.kind();
        if let Err(e) = self.sender.send(body).await {
            warn!(%kind, "Failed to queue message: {}", e);
        }
    }
}

async fn join_active(
    active: &mut Option<ActiveTask>,
) -> Result<(TaskRunner, TaskExecution), JoinError> {
    match active {
        Some(active) => (&mut active.handle).await,
        None => std::future::pending().await,
    }
}
