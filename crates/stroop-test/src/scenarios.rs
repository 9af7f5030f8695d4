//! End-to-end scenarios
//!
//! Each scenario drives real components over the memory transport and
//! returns a report; the tests pin the numbers on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use stroop_core::{DeviceId, SessionClock, SessionId, StroopResult, TaskId, TransportError};
use stroop_runtime::ResponderNode;
use stroop_task::TaskExecution;
use stroop_transport::{
    memory_transport, ConnectionManager, ConnectionState, LocalDiscovery, StaticDiscovery,
};
use stroop_wire::{Message, MessageBody, TaskOutcome, TaskResults};

use crate::harness::{
    connect_link, connection_config, device_config, loopback_addr, wait_for_state, LoopbackPair,
    PeerClose, ScriptedResponder, SubjectProfile,
};

// ============================================================================
// TIMED TASK
// ============================================================================

/// One task run between two real nodes
#[derive(Clone, Debug)]
pub struct TimedTaskScenario {
    pub timeout: Duration,
    pub subject: Option<SubjectProfile>,
    /// Send `end_task` this long after the start request
    pub end_after: Option<Duration>,
    pub seed: u64,
}

/// What a timed task produced on both sides
#[derive(Debug)]
pub struct TimedTaskReport {
    /// Results as received by the initiator
    pub results: Option<TaskResults>,
    /// Execution as handed to persistence on the responder
    pub persisted: Option<TaskExecution>,
    /// Verdicts the simulated subject gave
    pub answered: u32,
}

impl TimedTaskScenario {
    pub fn new(timeout: Duration) -> Self {
        TimedTaskScenario {
            timeout,
            subject: None,
            end_after: None,
            seed: 7,
        }
    }

    pub fn with_subject(mut self, profile: SubjectProfile) -> Self {
        self.subject = Some(profile);
        self
    }

    pub fn end_after(mut self, after: Duration) -> Self {
        self.end_after = Some(after);
        self
    }

    pub async fn run(self) -> StroopResult<TimedTaskReport> {
        let tasks = [("stroop", self.timeout)];
        let mut pair = LoopbackPair::start(&device_config(1, &tasks), &device_config(2, &tasks))?;
        if !pair.wait_connected().await {
            return Err(TransportError::Closed.into());
        }

        let subject = self
            .subject
            .map(|profile| pair.spawn_subject(profile, self.seed));
        let session = pair.session();
        let mut snapshots = session.subscribe();

        let task_id = session.start_task().await?;
        if let Some(after) = self.end_after {
            tokio::time::sleep(after).await;
            session.end_task().await?;
        }
        let _ = snapshots.wait_for(|s| s.completed >= 1).await;

        let results = session.results(task_id).await;
        let persisted = pair.display.executions.recv().await;
        pair.shutdown().await;

        let answered = match subject {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        };
        Ok(TimedTaskReport {
            results,
            persisted,
            answered,
        })
    }
}

// ============================================================================
// RECONNECTION
// ============================================================================

/// Backoff observed by a scripted responder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectReport {
    /// Gap before each reconnection attempt, measured at the acceptor
    pub delays: Vec<Duration>,
    pub session_before: SessionId,
    pub session_after: SessionId,
    /// Session presented in the final handshake
    pub handshake_session: SessionId,
    pub reconnected: bool,
}

/// Drop the connection `drops` times: once as an established link, then
/// at each following attempt before the handshake. The next attempt is
/// answered.
pub async fn reconnect_scenario(drops: usize) -> StroopResult<ReconnectReport> {
    let addr = loopback_addr();
    let (connector, acceptor) = memory_transport(addr);
    let mut peer = ScriptedResponder::new(acceptor, DeviceId::new(2));
    let (handle, _inbound) = ConnectionManager::initiator(
        connection_config(1),
        Arc::new(StaticDiscovery::new(addr)),
        connector,
        SessionId::new(0x5700_0c01),
        SessionClock::new(),
    );
    let mut status = handle.status();

    let first = peer.accept_link().await?;
    wait_for_state(&mut status, ConnectionState::Connected).await;
    let session_before = handle.session_id();
    let mut last = Instant::now();
    drop(first);

    let mut delays = Vec::with_capacity(drops);
    for _ in 1..drops {
        let at = peer.accept_and_drop().await?;
        delays.push(at - last);
        last = at;
    }
    let link = peer.accept_link().await?;
    delays.push(link.opened_at - last);
    let reconnected = wait_for_state(&mut status, ConnectionState::Connected).await;

    let report = ReconnectReport {
        delays,
        session_before,
        session_after: handle.session_id(),
        handshake_session: link.session_id(),
        reconnected,
    };
    handle.shutdown().await;
    Ok(report)
}

// ============================================================================
// SILENT PEER
// ============================================================================

/// How the initiator reacted to a peer that stopped talking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SilenceReport {
    /// Connected time until the link was declared dead
    pub connected_for: Duration,
    /// What the silent peer saw of the initiator
    pub peer: PeerClose,
}

/// Handshake, then say nothing while still reading
pub async fn silent_peer_scenario() -> StroopResult<SilenceReport> {
    let addr = loopback_addr();
    let (connector, acceptor) = memory_transport(addr);
    let mut peer = ScriptedResponder::new(acceptor, DeviceId::new(2));
    let (handle, _inbound) = ConnectionManager::initiator(
        connection_config(1),
        Arc::new(StaticDiscovery::new(addr)),
        connector,
        SessionId::new(0x5700_0d01),
        SessionClock::new(),
    );
    let mut status = handle.status();

    let link = peer.accept_link().await?;
    wait_for_state(&mut status, ConnectionState::Connected).await;
    let connected_at = Instant::now();
    let drain = tokio::spawn(link.drain());

    wait_for_state(&mut status, ConnectionState::Disconnected).await;
    let connected_for = connected_at.elapsed();
    let peer_close = drain.await.unwrap_or(PeerClose {
        heartbeats: 0,
        clean: false,
    });

    handle.shutdown().await;
    Ok(SilenceReport {
        connected_for,
        peer: peer_close,
    })
}

// ============================================================================
// DEFERRED RESULTS
// ============================================================================

/// Results of a task that finished while the link was down
#[derive(Debug)]
pub struct DeferredResultsReport {
    pub started: bool,
    /// Execution handed to persistence while disconnected
    pub persisted: Option<TaskExecution>,
    pub connected_at_completion: bool,
    /// Non-heartbeat messages received after reconnecting
    pub delivered: Vec<Message>,
}

/// Start a task, cut the link, and collect the results on reconnection
pub async fn deferred_results_scenario(timeout: Duration) -> StroopResult<DeferredResultsReport> {
    let (connector, acceptor) = memory_transport(loopback_addr());
    let config = device_config(2, &[("deferred", timeout)]);
    let (responder, mut display) =
        ResponderNode::start(&config, Arc::new(LocalDiscovery::new()), acceptor)?;
    let session = SessionId::new(0x5700_0e01);

    let mut link = connect_link(&connector, session, DeviceId::new(1)).await?;
    link.send(MessageBody::StartTask {
        task_id: TaskId::from("deferred"),
        label: "Deferred".into(),
        timeout_ms: timeout.as_millis() as u64,
    })
    .await?;
    let started = matches!(
        link.recv().await,
        Some(Message {
            body: MessageBody::StroopStarted { .. },
            ..
        })
    );
    drop(link);

    let persisted = display.executions.recv().await;
    let connected_at_completion = responder.connection().status().borrow().is_connected();

    let mut link = connect_link(&connector, session, DeviceId::new(1)).await?;
    let mut delivered = Vec::new();
    while delivered.len() < 2 {
        match link.recv().await {
            Some(message) => delivered.push(message),
            None => break,
        }
    }

    drop(link);
    responder.shutdown().await;
    Ok(DeferredResultsReport {
        started,
        persisted,
        connected_at_completion,
        delivered,
    })
}

// ============================================================================
// UNREAD RESULTS
// ============================================================================

/// Results written into a link the peer had stopped reading
#[derive(Debug)]
pub struct UnreadResultsReport {
    pub started: bool,
    /// The responder still saw the link as up when the task sealed
    pub connected_at_completion: bool,
    /// First non-heartbeat message on the next link
    pub redelivered: Option<Message>,
    /// Whether another copy arrived after the acknowledgement
    pub resent_after_ack: bool,
}

/// Start a task, stop reading, and reconnect once the task has sealed
pub async fn unread_results_scenario(timeout: Duration) -> StroopResult<UnreadResultsReport> {
    let (connector, acceptor) = memory_transport(loopback_addr());
    let config = device_config(2, &[("unread", timeout)]);
    let (responder, mut display) =
        ResponderNode::start(&config, Arc::new(LocalDiscovery::new()), acceptor)?;
    let session = SessionId::new(0x5700_0f01);

    let mut link = connect_link(&connector, session, DeviceId::new(1)).await?;
    link.send(MessageBody::StartTask {
        task_id: TaskId::from("unread"),
        label: "Unread".into(),
        timeout_ms: timeout.as_millis() as u64,
    })
    .await?;
    let started = matches!(
        link.recv().await,
        Some(Message {
            body: MessageBody::StroopStarted { .. },
            ..
        })
    );

    // Everything from here on lands in a buffer nobody reads
    let _persisted = display.executions.recv().await;
    let connected_at_completion = responder.connection().status().borrow().is_connected();
    drop(link);

    let mut link = connect_link(&connector, session, DeviceId::new(1)).await?;
    let redelivered = link.recv().await;
    link.send(MessageBody::ResultsReceived {
        task_id: TaskId::from("unread"),
    })
    .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(link);

    let mut link = connect_link(&connector, session, DeviceId::new(1)).await?;
    let resent_after_ack = tokio::time::timeout(Duration::from_secs(6), link.recv())
        .await
        .is_ok();

    drop(link);
    responder.shutdown().await;
    Ok(UnreadResultsReport {
        started,
        connected_at_completion,
        redelivered,
        resent_after_ack,
    })
}
