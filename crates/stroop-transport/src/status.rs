//! Connection status published to the presentation layer

use std::fmt;
use std::net::SocketAddr;

use stroop_core::SessionId;

/// Which side of the session this device plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Driving device; owns the session and task sequencing
    Initiator,
    /// Display device; renders stimuli and reports results
    Responder,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Initiator => f.write_str("initiator"),
            ConnectionRole::Responder => f.write_str("responder"),
        }
    }
}

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Initiator looking up the peer
    Discovering,
    /// Responder waiting for the peer
    Advertising,
    Connecting,
    Connected,
    /// Last attempt failed; a retry is scheduled
    Error,
}

/// Last-value connection snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub session_id: SessionId,
    /// Consecutive failed attempts since the last successful handshake
    pub attempt: u32,
    pub peer: Option<SocketAddr>,
    /// Links established so far; bumps on every reconnection
    pub links: u64,
}

impl ConnectionStatus {
    pub fn new(role: ConnectionRole, session_id: SessionId) -> Self {
        ConnectionStatus {
            role,
            state: ConnectionState::Disconnected,
            session_id,
            attempt: 0,
            peer: None,
            links: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}
