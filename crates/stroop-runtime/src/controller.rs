//! Session controller (initiator side)
//!
//! Owns the `SessionState` and turns presentation requests into protocol
//! commands. Results come back as `task_completed` and advance the
//! session; every copy is acknowledged with `results_received` so the
//! display device stops resending it. One task owns the controller;
//! `SessionClient` talks to it over a command channel and the state is
//! published as a `SessionSnapshot`.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stroop_core::{SessionError, StroopError, StroopResult, Task, TaskId, TransportError};
use stroop_task::SessionState;
use stroop_transport::{Inbound, MessageSender};
use stroop_wire::{ErrorCode, Message, MessageBody, TaskOutcome, TaskPhase, TaskResults};

const COMMAND_CAPACITY: usize = 16;

/// Last-value view of the session for the presentation layer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub current_task: Option<TaskId>,
    pub current_index: usize,
    pub completed: usize,
    pub total: usize,
    pub is_complete: bool,
    /// Task started on the display device and not yet reported complete
    pub running: Option<TaskId>,
    /// Phase last reported by the display device
    pub phase: TaskPhase,
    pub stimuli_shown: u32,
    pub remaining: Duration,
    pub last_outcome: Option<TaskOutcome>,
    pub last_error: Option<String>,
}

type Reply<T> = oneshot::Sender<StroopResult<T>>;

/// Requests accepted by the controller task
#[derive(Debug)]
pub enum SessionCommand {
    Start(Reply<TaskId>),
    End(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Restart(Reply<()>),
    Next(Reply<TaskId>),
    Select(TaskId, Reply<()>),
    Cancel(Reply<()>),
    Results(TaskId, oneshot::Sender<Option<TaskResults>>),
}

/// Cloneable handle on a running controller
#[derive(Clone, Debug)]
pub struct SessionClient {
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionClient {
    pub async fn start_task(&self) -> StroopResult<TaskId> {
        self.request(SessionCommand::Start).await
    }

    pub async fn end_task(&self) -> StroopResult<()> {
        self.request(SessionCommand::End).await
    }

    pub async fn pause_task(&self) -> StroopResult<()> {
        self.request(SessionCommand::Pause).await
    }

    pub async fn resume_task(&self) -> StroopResult<()> {
        self.request(SessionCommand::Resume).await
    }

    pub async fn restart_task(&self) -> StroopResult<()> {
        self.request(SessionCommand::Restart).await
    }

    pub async fn next_task(&self) -> StroopResult<TaskId> {
        self.request(SessionCommand::Next).await
    }

    pub async fn select_task(&self, task_id: TaskId) -> StroopResult<()> {
        self.request(|reply| SessionCommand::Select(task_id, reply)).await
    }

    pub async fn cancel_session(&self) -> StroopResult<()> {
        self.request(SessionCommand::Cancel).await
    }

    /// Results received for `task_id`, if any
    pub async fn results(&self, task_id: TaskId) -> Option<TaskResults> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Results(task_id, tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> StroopResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

/// Initiator-side session owner
pub struct SessionController {
    session: SessionState,
    catalog: BTreeMap<TaskId, Task>,
    sender: MessageSender,
    results: BTreeMap<TaskId, TaskResults>,
    running: Option<TaskId>,
    phase: TaskPhase,
    stimuli_shown: u32,
    remaining: Duration,
    last_outcome: Option<TaskOutcome>,
    last_error: Option<String>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Create a controller for `tasks`, run in the given order
    pub fn new(tasks: Vec<Task>, sender: MessageSender) -> Result<Self, SessionError> {
        let session = SessionState::new(tasks.iter().map(|t| t.id.clone()).collect())?;
        let catalog = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let (snapshot, _) = watch::channel(SessionSnapshot::default());

        let controller = SessionController {
            session,
            catalog,
            sender,
            results: BTreeMap::new(),
            running: None,
            phase: TaskPhase::Waiting,
            stimuli_shown: 0,
            remaining: Duration::ZERO,
            last_outcome: None,
            last_error: None,
            snapshot,
        };
        controller.publish();
        Ok(controller)
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn running_task(&self) -> Option<&TaskId> {
        self.running.as_ref()
    }

    pub fn results(&self, task_id: &TaskId) -> Option<&TaskResults> {
        self.results.get(task_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Ask the display device to start the current task
    pub async fn start_current_task(&mut self) -> StroopResult<TaskId> {
        if let Some(running) = &self.running {
            return Err(SessionError::TaskRunning(running.clone()).into());
        }
        if self.session.is_session_complete() {
            return Err(SessionError::SessionComplete.into());
        }
        let task = self
            .session
            .current_task_id()
            .and_then(|id| self.catalog.get(id))
            .cloned()
            .ok_or(SessionError::SessionComplete)?;

        self.sender
            .send(MessageBody::StartTask {
                task_id: task.id.clone(),
                label: task.label.clone(),
                timeout_ms: task.timeout.as_millis() as u64,
            })
            .await?;

        info!(task_id = %task.id, connected = self.sender.is_connected(), "Task start requested");
        self.running = Some(task.id.clone());
        self.phase = TaskPhase::Waiting;
        self.stimuli_shown = 0;
        self.remaining = task.timeout;
        self.last_outcome = None;
        self.last_error = None;
        self.publish();
        Ok(task.id)
    }

    /// End the running task; results are kept
    pub async fn end_current_task(&mut self) -> StroopResult<()> {
        let task_id = self.running_or_err()?;
        self.sender.send(MessageBody::EndTask { task_id }).await?;
        Ok(())
    }

    pub async fn pause_current_task(&mut self) -> StroopResult<()> {
        let task_id = self.running_or_err()?;
        self.sender.send(MessageBody::PauseTask { task_id }).await?;
        Ok(())
    }

    pub async fn resume_current_task(&mut self) -> StroopResult<()> {
        let task_id = self.running_or_err()?;
        self.sender.send(MessageBody::ResumeTask { task_id }).await?;
        Ok(())
    }

    /// Stop the current task if it runs, discard its results and make it
    /// pending again
    pub async fn restart_current_task(&mut self) -> StroopResult<()> {
        self.reset_running().await?;
        if let Some(task_id) = self.session.current_task_id().cloned() {
            self.results.remove(&task_id);
            info!(task_id = %task_id, "Task restarted");
        }
        self.session.restart_current_task();
        self.publish();
        Ok(())
    }

    /// Advance to the next task in the sequence
    pub async fn next_task(&mut self) -> StroopResult<TaskId> {
        if let Some(running) = &self.running {
            return Err(SessionError::TaskRunning(running.clone()).into());
        }
        let next = self.session.move_to_next_task()?.clone();
        self.phase = TaskPhase::Waiting;
        self.publish();
        Ok(next)
    }

    /// Jump to a task of the sequence
    pub async fn select_task(&mut self, task_id: &TaskId) -> StroopResult<()> {
        if let Some(running) = &self.running {
            return Err(SessionError::TaskRunning(running.clone()).into());
        }
        self.session.select_task(task_id)?;
        self.phase = TaskPhase::Waiting;
        self.publish();
        Ok(())
    }

    /// Emergency-stop any running task and start the session over
    pub async fn cancel_session(&mut self) -> StroopResult<()> {
        self.reset_running().await?;
        self.session.reset_session();
        self.results.clear();
        self.phase = TaskPhase::Waiting;
        self.last_outcome = None;
        info!(session_id = %self.sender.session_id(), "Session cancelled");
        self.publish();
        Ok(())
    }

    /// Fold a message from the display device into the session
    pub async fn handle_inbound(&mut self, message: Message) {
        match message.body {
            MessageBody::StroopStarted { task_id } => {
                if self.is_running(&task_id) {
                    debug!(task_id = %task_id, "Display started task");
                    self.phase = TaskPhase::Countdown;
                } else {
                    debug!(task_id = %task_id, "Start report for task not running");
                }
            }
            MessageBody::TaskStatus {
                task_id,
                phase,
                stimuli_shown,
                remaining_ms,
            } => {
                if self.is_running(&task_id) {
                    self.phase = phase;
                    self.stimuli_shown = stimuli_shown;
                    self.remaining = Duration::from_millis(remaining_ms);
                }
            }
            MessageBody::StroopEnded { task_id, outcome } => {
                if self.is_running(&task_id) {
                    info!(task_id = %task_id, ?outcome, "Display ended task");
                    self.phase = TaskPhase::Completed;
                    self.last_outcome = Some(outcome);
                }
            }
            MessageBody::TaskCompleted { results } => {
                let task_id = results.task_id.clone();
                self.accept_results(results);
                if let Err(e) = self.sender.send(MessageBody::ResultsReceived { task_id }).await {
                    warn!("Failed to acknowledge results: {}", e);
                }
            }
            MessageBody::Error { code, message } => {
                warn!(?code, error = %message, "Peer reported error");
                if matches!(code, ErrorCode::UnknownTask | ErrorCode::NotReady) {
                    // The start request was refused
                    self.running = None;
                    self.phase = TaskPhase::Waiting;
                }
                self.last_error = Some(message);
            }
            other => {
                warn!(kind = %other.kind(), "Unexpected message for initiator");
                return;
            }
        }
        self.publish();
    }

    /// Serve client commands and inbound messages until either side closes
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbound: Inbound,
    ) -> Self {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
                message = inbound.recv() => match message {
                    Some(message) => self.handle_inbound(message).await,
                    None => break,
                },
            }
        }
        debug!("Session controller stopped");
        self
    }

    /// Spawn the controller onto its own task
    pub fn spawn(self, inbound: Inbound) -> (SessionClient, JoinHandle<SessionController>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let client = SessionClient {
            commands: tx,
            snapshot: self.subscribe(),
        };
        let task = tokio::spawn(self.run(rx, inbound));
        (client, task)
    }

    async fn dispatch(&mut self, command: SessionCommand) {
        // A dropped reply receiver just means the caller stopped waiting
        match command {
            SessionCommand::Start(reply) => {
                let _ = reply.send(self.start_current_task().await);
            }
            SessionCommand::End(reply) => {
                let _ = reply.send(self.end_current_task().await);
            }
            SessionCommand::Pause(reply) => {
                let _ = reply.send(self.pause_current_task().await);
            }
            SessionCommand::Resume(reply) => {
                let _ = reply.send(self.resume_current_task().await);
            }
            SessionCommand::Restart(reply) => {
                let _ = reply.send(self.restart_current_task().await);
            }
            SessionCommand::Next(reply) => {
                let _ = reply.send(self.next_task().await);
            }
            SessionCommand::Select(task_id, reply) => {
                let _ = reply.send(self.select_task(&task_id).await);
            }
            SessionCommand::Cancel(reply) => {
                let _ = reply.send(self.cancel_session().await);
            }
            SessionCommand::Results(task_id, reply) => {
                let _ = reply.send(self.results.get(&task_id).cloned());
            }
        }
    }

    fn accept_results(&mut self, results: TaskResults) {
        let task_id = results.task_id.clone();
        // Covers resent copies as well as results of a reset task
        if !self.is_running(&task_id) {
            debug!(task_id = %task_id, "Results for task not running ignored");
            return;
        }

        info!(
            task_id = %task_id,
            outcome = ?results.outcome,
            stimuli_shown = results.stimuli_shown,
            completion_rate = results.completion_rate,
            "Task results received"
        );
        self.last_outcome = Some(results.outcome);
        self.results.insert(task_id.clone(), results);
        self.running = None;
        self.phase = TaskPhase::Completed;
        if self.session.current_task_id() == Some(&task_id) {
            if let Err(e) = self.session.complete_current_task() {
                warn!(task_id = %task_id, error = %e, "Could not complete task");
            }
        }
    }

    async fn reset_running(&mut self) -> Result<(), StroopError> {
        if let Some(task_id) = self.running.take() {
            self.sender
                .send(MessageBody::ResetTask {
                    task_id: task_id.clone(),
                })
                .await?;
            info!(task_id = %task_id, "Task reset requested");
            self.phase = TaskPhase::Waiting;
            self.stimuli_shown = 0;
        }
        Ok(())
    }

    fn running_or_err(&self) -> Result<TaskId, SessionError> {
        self.running.clone().ok_or(SessionError::NoRunningTask)
    }

    fn is_running(&self, task_id: &TaskId) -> bool {
        self.running.as_ref() == Some(task_id)
    }

    fn publish(&self) {
        let (completed, total) = self.session.progress();
        self.snapshot.send_replace(SessionSnapshot {
            current_task: self.session.current_task_id().cloned(),
            current_index: self.session.current_index(),
            completed,
            total,
            is_complete: self.session.is_session_complete(),
            running: self.running.clone(),
            phase: self.phase,
            stimuli_shown: self.stimuli_shown,
            remaining: self.remaining,
            last_outcome: self.last_outcome,
            last_error: self.last_error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stroop_core::{SessionClock, SessionId, Timestamp};
    use stroop_transport::{ConnectionRole, DetachedQueue};
    use stroop_wire::MessageKind;

    fn tasks() -> Vec<Task> {
        vec![
            Task::new("warmup", "Warm-up", Duration::from_secs(30)),
            Task::new("main", "Main", Duration::from_secs(180)),
        ]
    }

    fn controller() -> (SessionController, DetachedQueue) {
        let (sender, queue) = MessageSender::detached(
            ConnectionRole::Initiator,
            SessionId::new(5),
            SessionClock::with_origin(Timestamp::ZERO),
            16,
        );
        (SessionController::new(tasks(), sender).unwrap(), queue)
    }

    fn inbound(body: MessageBody) -> Message {
        Message::new(SessionId::new(5), Timestamp::ZERO, body)
    }

    fn results(task_id: &str, outcome: TaskOutcome) -> TaskResults {
        TaskResults::aggregate(
            TaskId::from(task_id),
            outcome,
            Timestamp::from_millis(0),
            Timestamp::from_millis(33_000),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_start_sends_command() {
        let (mut controller, mut queue) = controller();

        let started = controller.start_current_task().await.unwrap();
        assert_eq!(started, TaskId::from("warmup"));

        let message = queue.outbound.recv().await.unwrap();
        assert_eq!(message.session_id, SessionId::new(5));
        assert_eq!(
            message.body,
            MessageBody::StartTask {
                task_id: TaskId::from("warmup"),
                label: "Warm-up".into(),
                timeout_ms: 30_000,
            }
        );

        let err = controller.start_current_task().await.unwrap_err();
        assert!(matches!(err, StroopError::Session(SessionError::TaskRunning(_))));
    }

    #[tokio::test]
    async fn test_completion_advances_session() {
        let (mut controller, _queue) = controller();
        let snapshots = controller.subscribe();

        controller.start_current_task().await.unwrap();
        controller
            .handle_inbound(inbound(MessageBody::StroopStarted {
                task_id: TaskId::from("warmup"),
            }))
            .await;
        assert_eq!(snapshots.borrow().phase, TaskPhase::Countdown);

        controller
            .handle_inbound(inbound(MessageBody::TaskCompleted {
                results: results("warmup", TaskOutcome::TimedOut),
            }))
            .await;
        assert!(controller.running_task().is_none());
        assert!(controller.session().is_task_completed(&TaskId::from("warmup")));
        assert_eq!(snapshots.borrow().completed, 1);

        assert_eq!(controller.next_task().await.unwrap(), TaskId::from("main"));
        controller.start_current_task().await.unwrap();
        controller
            .handle_inbound(inbound(MessageBody::TaskCompleted {
                results: results("main", TaskOutcome::Ended),
            }))
            .await;
        assert!(snapshots.borrow().is_complete);
        assert!(matches!(
            controller.next_task().await,
            Err(StroopError::Session(SessionError::NoNextTask))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_results_ignored() {
        let (mut controller, _queue) = controller();
        controller.start_current_task().await.unwrap();

        let first = results("warmup", TaskOutcome::TimedOut);
        controller
            .handle_inbound(inbound(MessageBody::TaskCompleted {
                results: first.clone(),
            }))
            .await;
        controller
            .handle_inbound(inbound(MessageBody::TaskCompleted {
                results: results("warmup", TaskOutcome::Stopped),
            }))
            .await;

        assert_eq!(controller.results(&TaskId::from("warmup")), Some(&first));
        assert_eq!(controller.session().progress(), (1, 2));
    }

    #[tokio::test]
    async fn test_every_copy_acknowledged() {
        let (mut controller, mut queue) = controller();
        controller.start_current_task().await.unwrap();
        for _ in 0..2 {
            controller
                .handle_inbound(inbound(MessageBody::TaskCompleted {
                    results: results("warmup", TaskOutcome::TimedOut),
                }))
                .await;
        }
        // Stale results of a task that is not running are acknowledged too
        controller
            .handle_inbound(inbound(MessageBody::TaskCompleted {
                results: results("main", TaskOutcome::Stopped),
            }))
            .await;
        assert!(controller.results(&TaskId::from("main")).is_none());

        let bodies: Vec<_> = std::iter::from_fn(|| queue.outbound.try_recv().ok())
            .map(|m| m.body)
            .collect();
        assert_eq!(
            bodies[1..],
            [
                MessageBody::ResultsReceived {
                    task_id: TaskId::from("warmup")
                },
                MessageBody::ResultsReceived {
                    task_id: TaskId::from("warmup")
                },
                MessageBody::ResultsReceived {
                    task_id: TaskId::from("main")
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_discards_results() {
        let (mut controller, mut queue) = controller();
        controller.start_current_task().await.unwrap();
        controller
            .handle_inbound(inbound(MessageBody::TaskCompleted {
                results: results("warmup", TaskOutcome::TimedOut),
            }))
            .await;

        controller.restart_current_task().await.unwrap();
        assert!(controller.results(&TaskId::from("warmup")).is_none());
        assert!(!controller.session().is_task_completed(&TaskId::from("warmup")));

        // Nothing was running, so no reset went out
        assert_eq!(queue.outbound.recv().await.unwrap().kind(), MessageKind::StartTask);
        assert_eq!(
            queue.outbound.recv().await.unwrap().kind(),
            MessageKind::ResultsReceived
        );
        assert!(queue.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_requires_running_task() {
        let (mut controller, mut queue) = controller();
        assert!(matches!(
            controller.end_current_task().await,
            Err(StroopError::Session(SessionError::NoRunningTask))
        ));

        controller.start_current_task().await.unwrap();
        controller.pause_current_task().await.unwrap();
        controller.resume_current_task().await.unwrap();
        controller.end_current_task().await.unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| queue.outbound.try_recv().ok())
            .map(|m| m.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::StartTask,
                MessageKind::PauseTask,
                MessageKind::ResumeTask,
                MessageKind::EndTask,
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_start_clears_running() {
        let (mut controller, _queue) = controller();
        controller.start_current_task().await.unwrap();
        controller
            .handle_inbound(inbound(MessageBody::Error {
                code: ErrorCode::NotReady,
                message: "generator unavailable".into(),
            }))
            .await;
        assert!(controller.running_task().is_none());
        assert_eq!(
            controller.subscribe().borrow().last_error.as_deref(),
            Some("generator unavailable")
        );
    }

    #[tokio::test]
    async fn test_cancel_resets_running_task() {
        let (mut controller, mut queue) = controller();
        controller.start_current_task().await.unwrap();
        controller.cancel_session().await.unwrap();

        assert_eq!(queue.outbound.recv().await.unwrap().kind(), MessageKind::StartTask);
        assert_eq!(
            queue.outbound.recv().await.unwrap().body,
            MessageBody::ResetTask {
                task_id: TaskId::from("warmup")
            }
        );
        assert!(controller.running_task().is_none());
        assert_eq!(controller.session().progress(), (0, 2));

        // A late end report for the reset task does not revive it
        controller
            .handle_inbound(inbound(MessageBody::StroopEnded {
                task_id: TaskId::from("warmup"),
                outcome: TaskOutcome::Stopped,
            }))
            .await;
        assert_eq!(controller.subscribe().borrow().last_outcome, None);
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let (controller, mut queue) = controller();
        let (_inbound_tx, inbound_rx) = mpsc::channel(4);
        let (client, task) = controller.spawn(inbound_rx);

        assert_eq!(client.start_task().await.unwrap(), TaskId::from("warmup"));
        assert_eq!(queue.outbound.recv().await.unwrap().kind(), MessageKind::StartTask);
        assert_eq!(client.snapshot().running, Some(TaskId::from("warmup")));
        assert!(client.results(TaskId::from("warmup")).await.is_none());

        drop(client);
        let controller = task.await.unwrap();
        assert_eq!(controller.running_task(), Some(&TaskId::from("warmup")));
    }
}
