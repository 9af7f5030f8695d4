//! Stroop node - wires one device from a `StroopConfig`
//!
//! Initiator: connection manager + session controller.
//! Responder: connection manager + display node + task runner.
//! Everything is owned by the node; nothing is global.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use stroop_core::{
    ConfigError, SessionClock, SessionId, StroopError, StroopResult, TransportError,
};
use stroop_task::TaskRunner;
use stroop_transport::{
    Acceptor, ConnectionHandle, ConnectionManager, ConnectionRole, ConnectionStatus, Connector,
    Discovery, StaticDiscovery,
};

use crate::{DisplayHandles, DisplayNode, SessionClient, SessionController, StroopConfig};

/// Initiator device: drives the session
pub struct InitiatorNode {
    connection: ConnectionHandle,
    session: SessionClient,
    controller: JoinHandle<SessionController>,
}

impl InitiatorNode {
    /// Start the initiator side under a fresh session id
    pub fn start<D, C>(config: &StroopConfig, discovery: Arc<D>, connector: C) -> StroopResult<Self>
    where
        D: Discovery,
        C: Connector,
    {
        config.validate()?;
        let clock = SessionClock::new();
        let session_id = SessionId::generate();
        let (connection, inbound) = ConnectionManager::initiator(
            config.connection_config(),
            discovery,
            connector,
            session_id,
            clock,
        );

        let controller = SessionController::new(config.tasks(), connection.sender())?;
        let (session, controller) = controller.spawn(inbound);

        info!(
            role = %ConnectionRole::Initiator,
            session_id = %session_id,
            device = %config.device.name,
            tasks = config.tasks.len(),
            "Node started"
        );
        Ok(InitiatorNode {
            connection,
            session,
            controller,
        })
    }

    /// Session requests go through this client
    pub fn session(&self) -> &SessionClient {
        &self.session
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Stop the connection and wait for the controller to wind down
    pub async fn shutdown(self) -> Option<SessionController> {
        self.connection.shutdown().await;
        match self.controller.await {
            Ok(controller) => Some(controller),
            Err(e) => {
                warn!("Session controller task failed: {}", e);
                None
            }
        }
    }
}

/// Responder device: runs the tasks
pub struct ResponderNode {
    connection: ConnectionHandle,
    display: JoinHandle<()>,
}

impl ResponderNode {
    /// Start the responder side; the session id is adopted on handshake
    pub fn start<D, A>(
        config: &StroopConfig,
        discovery: Arc<D>,
        acceptor: A,
    ) -> StroopResult<(Self, DisplayHandles)>
    where
        D: Discovery,
        A: Acceptor,
    {
        config.validate_connection()?;
        let generator = config.generator()?;
        let clock = SessionClock::new();
        let (connection, inbound) =
            ConnectionManager::responder(config.connection_config(), discovery, acceptor, clock);

        let runner = TaskRunner::new(generator, clock);
        let (display, handles) = DisplayNode::new(
            runner,
            connection.sender(),
            inbound,
            config.connection.status_interval,
        );
        let display = display.spawn();

        info!(
            role = %ConnectionRole::Responder,
            device = %config.device.name,
            "Node started"
        );
        Ok((
            ResponderNode {
                connection,
                display,
            },
            handles,
        ))
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Stop the connection; a running task is stopped and persisted
    pub async fn shutdown(self) {
        self.connection.shutdown().await;
        if let Err(e) = self.display.await {
            warn!("Display node task failed: {}", e);
        }
    }
}

/// One device of a Stroop session
pub enum StroopNode {
    Initiator(InitiatorNode),
    Responder(ResponderNode),
}

impl StroopNode {
    pub fn initiator<D, C>(
        config: &StroopConfig,
        discovery: Arc<D>,
        connector: C,
    ) -> StroopResult<Self>
    where
        D: Discovery,
        C: Connector,
    {
        InitiatorNode::start(config, discovery, connector).map(StroopNode::Initiator)
    }

    pub fn responder<D, A>(
        config: &StroopConfig,
        discovery: Arc<D>,
        acceptor: A,
    ) -> StroopResult<(Self, DisplayHandles)>
    where
        D: Discovery,
        A: Acceptor,
    {
        let (node, handles) = ResponderNode::start(config, discovery, acceptor)?;
        Ok((StroopNode::Responder(node), handles))
    }

    pub fn role(&self) -> ConnectionRole {
        match self {
            StroopNode::Initiator(_) => ConnectionRole::Initiator,
            StroopNode::Responder(_) => ConnectionRole::Responder,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        match self {
            StroopNode::Initiator(node) => node.connection(),
            StroopNode::Responder(node) => node.connection(),
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection().status()
    }

    pub fn session_id(&self) -> SessionId {
        self.connection().session_id()
    }

    /// Session client, initiator only
    pub fn session(&self) -> Option<&SessionClient> {
        match self {
            StroopNode::Initiator(node) => Some(node.session()),
            StroopNode::Responder(_) => None,
        }
    }

    pub async fn shutdown(self) {
        match self {
            StroopNode::Initiator(node) => {
                node.shutdown().await;
            }
            StroopNode::Responder(node) => node.shutdown().await,
        }
        info!("Node stopped");
    }
}

/// Bind the responder's TCP listener on the configured address
pub async fn bind_listener(config: &StroopConfig) -> Result<TcpListener, TransportError> {
    let addr = config.connection.listen_addr;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::Bind(format!("{}: {}", addr, e)))?;
    if let Ok(local) = listener.local_addr() {
        info!(%local, "Listening");
    }
    Ok(listener)
}

/// Discovery pinned to the configured peer address
pub fn static_discovery(config: &StroopConfig) -> Result<Arc<StaticDiscovery>, StroopError> {
    let addr = config
        .connection
        .peer_addr
        .ok_or_else(|| ConfigError::Invalid("connection.peer_addr is not set".into()))?;
    Ok(Arc::new(StaticDiscovery::new(addr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use stroop_core::TaskId;
    use stroop_transport::{memory_transport, ConnectionState, LocalDiscovery};
    use stroop_wire::TaskOutcome;

    use crate::TaskConfig;

    fn config(device_id: u64) -> StroopConfig {
        let mut config = StroopConfig {
            tasks: vec![
                TaskConfig {
                    id: "short".into(),
                    label: "Short".into(),
                    timeout: Duration::from_secs(10),
                },
                TaskConfig {
                    id: "long".into(),
                    label: "Long".into(),
                    timeout: Duration::from_secs(60),
                },
            ],
            ..StroopConfig::default()
        };
        config.device.device_id = Some(device_id);
        config.stimulus.seed = Some(device_id);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_runs_a_task() {
        let discovery = Arc::new(LocalDiscovery::new());
        let (connector, acceptor) = memory_transport(SocketAddr::from(([10, 1, 1, 1], 9000)));

        let (responder, mut handles) =
            StroopNode::responder(&config(2), Arc::clone(&discovery), acceptor).unwrap();
        let initiator = StroopNode::initiator(&config(1), discovery, connector).unwrap();
        assert_eq!(initiator.role(), ConnectionRole::Initiator);

        let mut status = responder.status();
        status
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(responder.session_id(), initiator.session_id());

        let session = initiator.session().unwrap().clone();
        assert_eq!(session.start_task().await.unwrap(), TaskId::from("short"));

        let mut snapshots = session.subscribe();
        snapshots.wait_for(|s| s.completed == 1).await.unwrap();
        let results = session.results(TaskId::from("short")).await.unwrap();
        assert_eq!(results.outcome, TaskOutcome::TimedOut);
        assert!(results.stimuli_shown >= 2);

        let execution = handles.executions.recv().await.unwrap();
        assert_eq!(execution.task_id(), &TaskId::from("short"));

        assert_eq!(session.next_task().await.unwrap(), TaskId::from("long"));

        initiator.shutdown().await;
        responder.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let discovery = Arc::new(LocalDiscovery::new());
        let (connector, _acceptor) = memory_transport(SocketAddr::from(([10, 1, 1, 1], 9000)));
        let mut config = config(1);
        config.tasks.clear();

        let err = StroopNode::initiator(&config, discovery, connector)
            .err()
            .unwrap();
        assert!(matches!(err, StroopError::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_responder_refuses_zero_status_interval() {
        let discovery = Arc::new(LocalDiscovery::new());
        let (_connector, acceptor) = memory_transport(SocketAddr::from(([10, 1, 1, 1], 9000)));
        let mut config = config(2);
        config.connection.status_interval = Duration::ZERO;

        let err = StroopNode::responder(&config, discovery, acceptor).err().unwrap();
        assert!(matches!(
            err,
            StroopError::Config(ConfigError::NonPositiveDuration("status_interval"))
        ));
    }

    #[test]
    fn test_static_discovery_requires_peer() {
        let mut config = config(1);
        assert!(static_discovery(&config).is_err());
        config.connection.peer_addr = Some(SocketAddr::from(([127, 0, 0, 1], 4000)));
        assert!(static_discovery(&config).is_ok());
    }
}
