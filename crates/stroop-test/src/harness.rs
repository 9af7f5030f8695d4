//! Two-device test harness
//!
//! Everything here runs over the in-memory transport, so whole sessions
//! can be driven on tokio's paused clock:
//! - Configuration fixtures
//! - A simulated test subject answering stimuli
//! - Scripted peers speaking the wire protocol by hand
//! - A loopback pair of real nodes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use stroop_core::{DeviceId, SessionClock, SessionId, StroopResult, TaskId, TransportError};
use stroop_runtime::{
    DisplayHandles, InitiatorNode, ResponderNode, SessionClient, StroopConfig, TaskConfig,
};
use stroop_task::TaskExecutionUiState;
use stroop_transport::{
    handshake, memory_transport, Acceptor, ConnectionConfig, ConnectionState, ConnectionStatus,
    Connector, HandshakeInfo, LocalDiscovery, MemoryAcceptor, MemoryConnector,
};
use stroop_wire::{FrameReader, FrameWriter, Message, MessageBody, StimulusResponse, TaskPhase};

// ============================================================================
// FIXTURES
// ============================================================================

/// Address the loopback transport listens on
pub fn loopback_addr() -> SocketAddr {
    SocketAddr::from(([10, 77, 0, 1], 7700))
}

/// Node configuration with a fixed device id and stimulus seed
pub fn device_config(device_id: u64, tasks: &[(&str, Duration)]) -> StroopConfig {
    let mut config = StroopConfig::default();
    config.device.name = format!("device-{}", device_id);
    config.device.device_id = Some(device_id);
    config.stimulus.seed = Some(device_id);
    config.tasks = tasks
        .iter()
        .map(|(id, timeout)| TaskConfig {
            id: id.to_string(),
            label: id.to_uppercase(),
            timeout: *timeout,
        })
        .collect();
    config
}

/// Connection manager settings with the default timings
pub fn connection_config(device_id: u64) -> ConnectionConfig {
    ConnectionConfig {
        device_id: DeviceId::new(device_id),
        ..ConnectionConfig::default()
    }
}

/// Wait until `status` reports `state`; false if the manager went away
pub async fn wait_for_state(
    status: &mut watch::Receiver<ConnectionStatus>,
    state: ConnectionState,
) -> bool {
    status.wait_for(|s| s.state == state).await.is_ok()
}

// ============================================================================
// SIMULATED SUBJECT
// ============================================================================

/// How a simulated subject responds
#[derive(Clone, Copy, Debug)]
pub struct SubjectProfile {
    pub reaction_min: Duration,
    pub reaction_max: Duration,
    /// Probability of a correct verdict
    pub accuracy: f64,
}

impl Default for SubjectProfile {
    fn default() -> Self {
        SubjectProfile {
            reaction_min: Duration::from_millis(400),
            reaction_max: Duration::from_millis(900),
            accuracy: 0.9,
        }
    }
}

/// Answers every displayed stimulus after a random reaction time
pub struct SimulatedSubject {
    profile: SubjectProfile,
    rng: StdRng,
}

impl SimulatedSubject {
    pub fn new(profile: SubjectProfile, seed: u64) -> Self {
        SimulatedSubject {
            profile,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample a reaction time within the profile bounds
    pub fn reaction_time(&mut self) -> Duration {
        let min = self.profile.reaction_min.as_millis() as u64;
        let max = self.profile.reaction_max.as_millis() as u64;
        Duration::from_millis(self.rng.gen_range(min..=max.max(min)))
    }

    pub fn verdict(&mut self) -> bool {
        self.rng.gen_bool(self.profile.accuracy.clamp(0.0, 1.0))
    }

    /// Answer stimuli until the display node goes away
    pub fn spawn(
        mut self,
        mut ui: watch::Receiver<TaskExecutionUiState>,
        verdicts: mpsc::Sender<StimulusResponse>,
        clock: SessionClock,
    ) -> JoinHandle<u32> {
        tokio::spawn(async move {
            let mut answered = 0u32;
            let mut task: Option<TaskId> = None;
            let mut seen = 0u32;
            loop {
                let state = match ui
                    .wait_for(|s| {
                        s.phase == TaskPhase::Display
                            && (s.task_id != task || s.stimuli_shown > seen)
                    })
                    .await
                {
                    Ok(state) => state.clone(),
                    Err(_) => break,
                };
                task = state.task_id;
                seen = state.stimuli_shown;

                tokio::time::sleep(self.reaction_time()).await;
                let response = StimulusResponse {
                    correct: self.verdict(),
                    responded_at: clock.now(),
                };
                if verdicts.send(response).await.is_err() {
                    break;
                }
                answered += 1;
            }
            debug!(answered, "Simulated subject finished");
            answered
        })
    }
}

// ============================================================================
// SCRIPTED PEERS
// ============================================================================

/// How a drained link ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerClose {
    pub heartbeats: u32,
    /// Closed between frames rather than by an I/O error
    pub clean: bool,
}

/// One side of a link driven by hand
pub struct PeerLink {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    clock: SessionClock,
    pub info: HandshakeInfo,
    /// When the stream was accepted or connected
    pub opened_at: Instant,
}

impl PeerLink {
    fn new(stream: DuplexStream, clock: SessionClock, opened_at: Instant) -> Self {
        let (reader, writer) = split(stream);
        PeerLink {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            clock,
            info: HandshakeInfo {
                session_id: SessionId::ZERO,
                peer_device: DeviceId::new(0),
            },
            opened_at,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.info.session_id
    }

    /// Next message including heartbeats; `None` on close or garbage
    pub async fn recv_any(&mut self) -> Option<Message> {
        let payload = self.reader.read_frame().await.ok()??;
        Message::decode(&payload).ok()
    }

    /// Next non-heartbeat message
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let message = self.recv_any().await?;
            if message.body != MessageBody::Heartbeat {
                return Some(message);
            }
        }
    }

    /// Read until the other side closes, counting heartbeats
    pub async fn drain(mut self) -> PeerClose {
        let mut heartbeats = 0;
        let clean = loop {
            match self.reader.read_frame().await {
                Ok(Some(payload)) => {
                    let decoded = Message::decode(&payload);
                    if matches!(decoded, Ok(m) if m.body == MessageBody::Heartbeat) {
                        heartbeats += 1;
                    }
                }
                Ok(None) => break true,
                Err(_) => break false,
            }
        };
        PeerClose { heartbeats, clean }
    }

    pub async fn send(&mut self, body: MessageBody) -> StroopResult<()> {
        let message = Message::new(self.info.session_id, self.clock.now(), body);
        self.writer.write_frame(&message.encode()?).await?;
        Ok(())
    }
}

/// Responder stand-in: accepts on a memory acceptor and answers (or
/// refuses) handshakes
pub struct ScriptedResponder {
    acceptor: MemoryAcceptor,
    device_id: DeviceId,
    clock: SessionClock,
}

impl ScriptedResponder {
    pub fn new(acceptor: MemoryAcceptor, device_id: DeviceId) -> Self {
        ScriptedResponder {
            acceptor,
            device_id,
            clock: SessionClock::new(),
        }
    }

    /// Accept the next connection without speaking
    pub async fn accept(&mut self) -> StroopResult<(DuplexStream, Instant)> {
        let (stream, _) = self
            .acceptor
            .accept()
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        Ok((stream, Instant::now()))
    }

    /// Accept and hang up before the handshake; returns the accept time
    pub async fn accept_and_drop(&mut self) -> StroopResult<Instant> {
        let (stream, at) = self.accept().await?;
        drop(stream);
        Ok(at)
    }

    /// Accept and complete the handshake
    pub async fn accept_link(&mut self) -> StroopResult<PeerLink> {
        let (stream, at) = self.accept().await?;
        let mut link = PeerLink::new(stream, self.clock, at);
        link.info = handshake::respond(
            &mut link.reader,
            &mut link.writer,
            self.device_id,
            &self.clock,
            Duration::from_secs(5),
        )
        .await?;
        Ok(link)
    }
}

/// Initiator stand-in: connect and handshake under `session_id`
pub async fn connect_link(
    connector: &MemoryConnector,
    session_id: SessionId,
    device_id: DeviceId,
) -> StroopResult<PeerLink> {
    let addr = loopback_addr();
    let stream = connector
        .connect(addr)
        .await
        .map_err(|e| TransportError::Connect {
            addr,
            reason: e.to_string(),
        })?;
    let clock = SessionClock::new();
    let mut link = PeerLink::new(stream, clock, Instant::now());
    link.info = handshake::initiate(
        &mut link.reader,
        &mut link.writer,
        session_id,
        device_id,
        &clock,
        Duration::from_secs(5),
    )
    .await?;
    Ok(link)
}

// ============================================================================
// LOOPBACK PAIR
// ============================================================================

/// Real initiator and responder nodes joined by the memory transport
pub struct LoopbackPair {
    pub initiator: InitiatorNode,
    pub responder: ResponderNode,
    pub display: DisplayHandles,
}

impl LoopbackPair {
    pub fn start(initiator: &StroopConfig, responder: &StroopConfig) -> StroopResult<Self> {
        let discovery = Arc::new(LocalDiscovery::new());
        let (connector, acceptor) = memory_transport(loopback_addr());

        let (responder, display) =
            ResponderNode::start(responder, Arc::clone(&discovery), acceptor)?;
        let initiator = InitiatorNode::start(initiator, discovery, connector)?;
        Ok(LoopbackPair {
            initiator,
            responder,
            display,
        })
    }

    /// Both sides connected under the same session
    pub async fn wait_connected(&self) -> bool {
        let mut initiator = self.initiator.connection().status();
        let mut responder = self.responder.connection().status();
        wait_for_state(&mut initiator, ConnectionState::Connected).await
            && wait_for_state(&mut responder, ConnectionState::Connected).await
            && self.initiator.connection().session_id() == self.responder.connection().session_id()
    }

    pub fn session(&self) -> SessionClient {
        self.initiator.session().clone()
    }

    /// Spawn a simulated subject on the responder's display
    pub fn spawn_subject(&self, profile: SubjectProfile, seed: u64) -> JoinHandle<u32> {
        SimulatedSubject::new(profile, seed).spawn(
            self.display.ui.clone(),
            self.display.verdicts.clone(),
            self.display.clock,
        )
    }

    pub async fn shutdown(self) {
        self.initiator.shutdown().await;
        self.responder.shutdown().await;
    }
}
