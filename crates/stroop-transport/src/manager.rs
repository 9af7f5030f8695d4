//! Connection manager
//!
//! A single task per device owns the connection state; it alone writes the
//! status channel, so only one transition is ever in flight.
//!
//! Initiator: discover → connect → handshake → link, and on loss retry
//! with exponential backoff under the same session id.
//! Responder: advertise → accept → handshake → link, adopting the session
//! id the initiator presents.
//!
//! The outbound queue outlives individual links: messages sent while
//! disconnected are delivered once a link is up again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stroop_core::{DeviceId, SessionClock, SessionId, TransportError};
use stroop_wire::{FrameReader, FrameWriter, Message, MessageBody};

use crate::handshake;
use crate::{
    Acceptor, Backoff, BackoffPolicy, ConnectionRole, ConnectionState, ConnectionStatus,
    Connector, Discovery, Link, LinkClosed, LinkConfig,
};

/// Connection manager configuration
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Name advertised/looked up through discovery
    pub service_name: String,
    pub device_id: DeviceId,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub link: LinkConfig,
    pub backoff: BackoffPolicy,
    /// Outbound queue bound; persists across reconnections
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            service_name: "stroop-link".to_string(),
            device_id: DeviceId::generate(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            link: LinkConfig::default(),
            backoff: BackoffPolicy::default(),
            outbound_capacity: 64,
            inbound_capacity: 64,
        }
    }
}

/// Messages received from the peer (heartbeats excluded)
pub type Inbound = mpsc::Receiver<Message>;

/// Cloneable sending half of a connection
#[derive(Clone)]
pub struct MessageSender {
    outbound: mpsc::Sender<Message>,
    status: watch::Receiver<ConnectionStatus>,
    clock: SessionClock,
}

/// Far side of a detached `MessageSender`
pub struct DetachedQueue {
    pub outbound: mpsc::Receiver<Message>,
    /// Drives what the sender reports as connection status
    pub status: watch::Sender<ConnectionStatus>,
}

impl MessageSender {
    /// Sender backed by a plain queue instead of a connection manager
    pub fn detached(
        role: ConnectionRole,
        session_id: SessionId,
        clock: SessionClock,
        capacity: usize,
    ) -> (Self, DetachedQueue) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::new(role, session_id));
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let sender = MessageSender {
            outbound: outbound_tx,
            status: status_rx,
            clock,
        };
        (
            sender,
            DetachedQueue {
                outbound: outbound_rx,
                status: status_tx,
            },
        )
    }

    /// Stamp the envelope and enqueue
    ///
    /// Succeeds while disconnected; the message waits in the queue.
    pub async fn send(&self, body: MessageBody) -> Result<(), TransportError> {
        let message = Message::new(self.session_id(), self.clock.now(), body);
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn session_id(&self) -> SessionId {
        self.status.borrow().session_id
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Subscribe to the status of the connection behind this sender
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

/// Owner's handle on a running connection manager
pub struct ConnectionHandle {
    sender: MessageSender,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub async fn send(&self, body: MessageBody) -> Result<(), TransportError> {
        self.sender.send(body).await
    }

    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Subscribe to connection status
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.sender.status()
    }

    pub fn session_id(&self) -> SessionId {
        self.sender.session_id()
    }

    /// Stop the manager and wait for it to reach Disconnected
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!("Connection manager task failed: {}", e);
        }
    }
}

/// Connection state owner
pub struct ConnectionManager<D> {
    config: ConnectionConfig,
    discovery: Arc<D>,
    clock: SessionClock,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::Sender<Message>,
    shutdown: watch::Receiver<bool>,
    /// `None` only while a link holds it
    outbound: Option<mpsc::Receiver<Message>>,
    unsent: Option<Message>,
}

impl<D: Discovery> ConnectionManager<D> {
    fn new(
        role: ConnectionRole,
        session_id: SessionId,
        config: ConnectionConfig,
        discovery: Arc<D>,
        clock: SessionClock,
    ) -> (Self, MessageSender, watch::Sender<bool>, Inbound) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::new(role, session_id));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sender = MessageSender {
            outbound: outbound_tx,
            status: status_rx,
            clock,
        };
        let manager = ConnectionManager {
            config,
            discovery,
            clock,
            status: status_tx,
            inbound: inbound_tx,
            shutdown: shutdown_rx,
            outbound: Some(outbound_rx),
            unsent: None,
        };
        (manager, sender, shutdown_tx, inbound_rx)
    }

    /// Spawn the initiator side for `session_id`
    pub fn initiator<C: Connector>(
        config: ConnectionConfig,
        discovery: Arc<D>,
        connector: C,
        session_id: SessionId,
        clock: SessionClock,
    ) -> (ConnectionHandle, Inbound) {
        let (manager, sender, shutdown, inbound) =
            Self::new(ConnectionRole::Initiator, session_id, config, discovery, clock);
        let task = tokio::spawn(manager.run_initiator(connector));
        (
            ConnectionHandle {
                sender,
                shutdown,
                task,
            },
            inbound,
        )
    }

    /// Spawn the responder side; the session id comes from the initiator
    pub fn responder<A: Acceptor>(
        config: ConnectionConfig,
        discovery: Arc<D>,
        acceptor: A,
        clock: SessionClock,
    ) -> (ConnectionHandle, Inbound) {
        let (manager, sender, shutdown, inbound) =
            Self::new(ConnectionRole::Responder, SessionId::ZERO, config, discovery, clock);
        let task = tokio::spawn(manager.run_responder(acceptor));
        (
            ConnectionHandle {
                sender,
                shutdown,
                task,
            },
            inbound,
        )
    }

    async fn run_initiator<C: Connector>(mut self, connector: C) {
        let session_id = self.status.borrow().session_id;
        let mut backoff = Backoff::new(self.config.backoff);
        info!(role = "initiator", session_id = %session_id, "Connection manager started");

        while !self.stopping() {
            match self.connect(&connector, session_id).await {
                Ok(link) => {
                    backoff.reset();
                    self.status.send_modify(|s| s.attempt = 0);
                    self.set_state(ConnectionState::Connected);

                    let reason = self.run_link(link).await;
                    self.set_state(ConnectionState::Disconnected);
                    if self.link_is_final(&reason) {
                        break;
                    }
                    warn!(session_id = %session_id, reason = %reason, "Link lost");
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    self.set_state(ConnectionState::Error);
                    warn!(
                        session_id = %session_id,
                        attempt = backoff.attempt() + 1,
                        error = %e,
                        "Connection attempt failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            self.status.send_modify(|s| s.attempt = backoff.attempt());
            info!(
                session_id = %session_id,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            if until_shutdown(&mut self.shutdown, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(role = "initiator", session_id = %session_id, "Connection manager stopped");
    }

    async fn connect<C: Connector>(
        &mut self,
        connector: &C,
        session_id: SessionId,
    ) -> Result<Link<ReadHalf<C::Stream>, WriteHalf<C::Stream>>, TransportError> {
        self.set_state(ConnectionState::Discovering);
        let discovery = Arc::clone(&self.discovery);
        let addr = until_shutdown(&mut self.shutdown, discovery.discover(&self.config.service_name))
            .await
            .ok_or(TransportError::Closed)??;

        self.status.send_modify(|s| s.peer = Some(addr));
        self.set_state(ConnectionState::Connecting);
        debug!(session_id = %session_id, %addr, "Connecting");

        let connect = tokio::time::timeout(self.config.connect_timeout, connector.connect(addr));
        let stream = match until_shutdown(&mut self.shutdown, connect).await {
            None => return Err(TransportError::Closed),
            Some(Err(_)) => return Err(TransportError::ConnectTimeout(addr)),
            Some(Ok(Err(e))) => {
                return Err(TransportError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Some(Ok(Ok(stream))) => stream,
        };

        let (reader, writer) = split(stream);
        let mut reader = FrameReader::new(reader);
        let mut writer = FrameWriter::new(writer);
        let exchange = handshake::initiate(
            &mut reader,
            &mut writer,
            session_id,
            self.config.device_id,
            &self.clock,
            self.config.handshake_timeout,
        );
        let info = until_shutdown(&mut self.shutdown, exchange)
            .await
            .ok_or(TransportError::Closed)??;

        info!(
            session_id = %session_id,
            peer_device = %info.peer_device,
            %addr,
            "Handshake complete"
        );
        Ok(Link::new(reader, writer, session_id, self.clock, self.config.link))
    }

    async fn run_responder<A: Acceptor>(mut self, mut acceptor: A) {
        let mut backoff = Backoff::new(self.config.backoff);
        info!(role = "responder", "Connection manager started");

        while !self.stopping() {
            self.set_state(ConnectionState::Advertising);
            let advertised = match acceptor.local_addr() {
                Ok(addr) => {
                    let discovery = Arc::clone(&self.discovery);
                    let name = self.config.service_name.clone();
                    match until_shutdown(&mut self.shutdown, discovery.advertise(&name, addr)).await {
                        None => break,
                        Some(result) => result,
                    }
                }
                Err(e) => Err(TransportError::Bind(e.to_string())),
            };
            if let Err(e) = advertised {
                if self.retry_after_error(&mut backoff, &e).await {
                    continue;
                }
                break;
            }

            let (stream, peer) = match until_shutdown(&mut self.shutdown, acceptor.accept()).await {
                None => break,
                Some(Ok(accepted)) => accepted,
                Some(Err(e)) => {
                    let e = TransportError::Bind(e.to_string());
                    if self.retry_after_error(&mut backoff, &e).await {
                        continue;
                    }
                    break;
                }
            };

            self.status.send_modify(|s| s.peer = Some(peer));
            self.set_state(ConnectionState::Connecting);

            let (reader, writer) = split(stream);
            let mut reader = FrameReader::new(reader);
            let mut writer = FrameWriter::new(writer);
            let exchange = handshake::respond(
                &mut reader,
                &mut writer,
                self.config.device_id,
                &self.clock,
                self.config.handshake_timeout,
            );
            let info = match until_shutdown(&mut self.shutdown, exchange).await {
                None => break,
                Some(Ok(info)) => info,
                Some(Err(e)) => {
                    self.set_state(ConnectionState::Error);
                    warn!(%peer, error = %e, "Inbound handshake failed");
                    continue;
                }
            };

            let current = self.status.borrow().session_id;
            if info.session_id != current {
                info!(
                    previous = %current,
                    session_id = %info.session_id,
                    "Adopting session"
                );
                self.status.send_modify(|s| s.session_id = info.session_id);
            }
            backoff.reset();
            self.status.send_modify(|s| s.attempt = 0);
            self.set_state(ConnectionState::Connected);
            info!(session_id = %info.session_id, peer_device = %info.peer_device, %peer, "Peer connected");

            let link = Link::new(reader, writer, info.session_id, self.clock, self.config.link);
            let reason = self.run_link(link).await;
            self.set_state(ConnectionState::Disconnected);
            if self.link_is_final(&reason) {
                break;
            }
            warn!(session_id = %info.session_id, reason = %reason, "Link lost");
        }

        self.set_state(ConnectionState::Disconnected);
        info!(role = "responder", "Connection manager stopped");
    }

    /// Log, back off, and report whether to keep going
    async fn retry_after_error(&mut self, backoff: &mut Backoff, error: &TransportError) -> bool {
        self.set_state(ConnectionState::Error);
        let delay = backoff.next_delay();
        self.status.send_modify(|s| s.attempt = backoff.attempt());
        warn!(
            error = %error,
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Responder error; retrying"
        );
        until_shutdown(&mut self.shutdown, tokio::time::sleep(delay))
            .await
            .is_some()
    }

    async fn run_link<R, W>(&mut self, link: Link<R, W>) -> LinkClosed
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(outbound) = self.outbound.take() else {
            return LinkClosed::OutboundClosed;
        };
        let end = link
            .run(outbound, self.unsent.take(), self.inbound.clone(), &mut self.shutdown)
            .await;
        self.outbound = end.outbound;
        self.unsent = end.unsent;
        if self.unsent.is_some() {
            debug!("Outbound message carried over to next link");
        }
        end.reason
    }

    /// Whether the manager should stop after this link
    fn link_is_final(&self, reason: &LinkClosed) -> bool {
        match reason {
            LinkClosed::Shutdown | LinkClosed::OutboundClosed => true,
            _ if self.outbound.is_none() => {
                self.set_state(ConnectionState::Error);
                warn!("Outbound queue lost; connection manager stopping");
                true
            }
            _ => self.stopping(),
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.status.send_if_modified(|s| {
            if s.state == state {
                false
            } else {
                s.state = state;
                if state == ConnectionState::Connected {
                    s.links += 1;
                }
                true
            }
        });
        if changed {
            let status = self.status.borrow();
            debug!(
                role = %status.role,
                session_id = %status.session_id,
                state = ?state,
                "Connection state changed"
            );
        }
    }
}

/// Run `fut` unless shutdown is requested first
async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        _ = shutdown.changed() => None,
        output = fut => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use stroop_core::{TaskId, Timestamp};
    use stroop_wire::MessageKind;
    use tokio::time::Instant;

    use crate::{memory_transport, LocalDiscovery, MemoryAcceptor, StaticDiscovery};

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 7000))
    }

    fn config(device: u64) -> ConnectionConfig {
        ConnectionConfig {
            device_id: DeviceId::new(device),
            ..Default::default()
        }
    }

    fn clock() -> SessionClock {
        SessionClock::with_origin(Timestamp::ZERO)
    }

    async fn wait_state(status: &mut watch::Receiver<ConnectionStatus>, state: ConnectionState) {
        status.wait_for(|s| s.state == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_sender_stamps_envelope() {
        let session = SessionId::new(77);
        let (sender, mut queue) =
            MessageSender::detached(ConnectionRole::Responder, session, clock(), 4);
        assert!(!sender.is_connected());

        sender.send(MessageBody::Heartbeat).await.unwrap();
        let message = queue.outbound.recv().await.unwrap();
        assert_eq!(message.session_id, session);
        assert_eq!(message.kind(), MessageKind::Heartbeat);

        queue.status.send_modify(|s| s.state = ConnectionState::Connected);
        assert!(sender.is_connected());

        drop(queue);
        assert!(matches!(
            sender.send(MessageBody::Heartbeat).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_connects_and_exchanges() {
        let discovery = Arc::new(LocalDiscovery::new());
        let (connector, acceptor) = memory_transport(addr());
        let session = SessionId::new(0x1234);

        let (responder, mut responder_in) =
            ConnectionManager::responder(config(2), Arc::clone(&discovery), acceptor, clock());
        let (initiator, mut initiator_in) =
            ConnectionManager::initiator(config(1), discovery, connector, session, clock());

        let mut status = initiator.status();
        wait_state(&mut status, ConnectionState::Connected).await;
        let mut peer_status = responder.status();
        wait_state(&mut peer_status, ConnectionState::Connected).await;
        assert_eq!(responder.session_id(), session);

        initiator
            .send(MessageBody::StartTask {
                task_id: TaskId::from("t1"),
                label: "Trial".into(),
                timeout_ms: 60_000,
            })
            .await
            .unwrap();
        let received = responder_in.recv().await.unwrap();
        assert_eq!(received.kind(), MessageKind::StartTask);
        assert_eq!(received.session_id, session);

        responder
            .send(MessageBody::StroopStarted {
                task_id: TaskId::from("t1"),
            })
            .await
            .unwrap();
        let reply = initiator_in.recv().await.unwrap();
        assert_eq!(reply.kind(), MessageKind::StroopStarted);

        // Heartbeats in both directions keep the pair up
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(initiator.status().borrow().is_connected());
        assert!(responder.status().borrow().is_connected());

        initiator.shutdown().await;
        responder.shutdown().await;
    }

    /// Accept one connection and complete the handshake by hand
    async fn accept_and_handshake(
        acceptor: &mut MemoryAcceptor,
    ) -> (
        FrameReader<ReadHalf<tokio::io::DuplexStream>>,
        FrameWriter<WriteHalf<tokio::io::DuplexStream>>,
        SessionId,
    ) {
        let (stream, _) = acceptor.accept().await.unwrap();
        let (r, w) = split(stream);
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        let info = handshake::respond(
            &mut reader,
            &mut writer,
            DeviceId::new(99),
            &clock(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (reader, writer, info.session_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_session_and_flushes_queue() {
        let (connector, mut acceptor) = memory_transport(addr());
        let session = SessionId::new(0x77);
        let (initiator, _inbound) = ConnectionManager::initiator(
            config(1),
            Arc::new(StaticDiscovery::new(addr())),
            connector,
            session,
            clock(),
        );
        let mut status = initiator.status();

        let (reader, writer, first_session) = accept_and_handshake(&mut acceptor).await;
        wait_state(&mut status, ConnectionState::Connected).await;
        assert_eq!(first_session, session);
        assert_eq!(status.borrow().links, 1);

        drop((reader, writer));
        let dropped_at = Instant::now();
        wait_state(&mut status, ConnectionState::Disconnected).await;

        initiator
            .send(MessageBody::EndTask {
                task_id: TaskId::from("queued"),
            })
            .await
            .unwrap();

        let (mut reader, _writer, second_session) = accept_and_handshake(&mut acceptor).await;
        assert_eq!(second_session, session);
        assert_eq!(dropped_at.elapsed(), Duration::from_secs(1));

        let payload = reader.read_frame().await.unwrap().unwrap();
        let delivered = Message::decode(&payload).unwrap();
        assert_eq!(delivered.body.task_id(), Some(&TaskId::from("queued")));
        assert_eq!(delivered.session_id, session);
        wait_state(&mut status, ConnectionState::Connected).await;
        assert_eq!(status.borrow().links, 2);

        initiator.shutdown().await;
        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_backs_off() {
        let (connector, acceptor) = memory_transport(addr());
        drop(acceptor);
        let (initiator, _inbound) = ConnectionManager::initiator(
            config(1),
            Arc::new(StaticDiscovery::new(addr())),
            connector,
            SessionId::new(5),
            clock(),
        );
        let mut status = initiator.status();

        status.wait_for(|s| s.attempt >= 3).await.unwrap();
        assert_ne!(status.borrow().state, ConnectionState::Connected);

        initiator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_adopts_new_session() {
        let discovery = Arc::new(LocalDiscovery::new());
        let (connector, acceptor) = memory_transport(addr());
        let (responder, _inbound) =
            ConnectionManager::responder(config(2), Arc::clone(&discovery), acceptor, clock());
        let mut peer_status = responder.status();

        let (first, _in1) = ConnectionManager::initiator(
            config(1),
            Arc::clone(&discovery),
            connector.clone(),
            SessionId::new(1),
            clock(),
        );
        peer_status
            .wait_for(|s| s.is_connected() && s.session_id == SessionId::new(1))
            .await
            .unwrap();
        first.shutdown().await;
        wait_state(&mut peer_status, ConnectionState::Advertising).await;

        let (second, _in2) =
            ConnectionManager::initiator(config(1), discovery, connector, SessionId::new(2), clock());
        peer_status
            .wait_for(|s| s.is_connected() && s.session_id == SessionId::new(2))
            .await
            .unwrap();

        second.shutdown().await;
        responder.shutdown().await;
    }
}
