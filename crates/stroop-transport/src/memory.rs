//! In-process loopback transport
//!
//! Each `connect` creates a `tokio::io::duplex` pair and hands the far end
//! to the acceptor. Runs entirely on tokio primitives, so it behaves under
//! the paused test clock.

use std::io;
use std::net::SocketAddr;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::{Acceptor, Connector};

/// Per-direction buffer of a loopback stream
pub const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

/// Create a connected connector/acceptor pair listening on `addr`
pub fn memory_transport(addr: SocketAddr) -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::channel(8);
    (
        MemoryConnector { addr, incoming: tx },
        MemoryAcceptor { addr, incoming: rx },
    )
}

/// Initiator side of the loopback transport
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    addr: SocketAddr,
    incoming: mpsc::Sender<DuplexStream>,
}

impl Connector for MemoryConnector {
    type Stream = DuplexStream;

    async fn connect(&self, addr: SocketAddr) -> io::Result<DuplexStream> {
        if addr != self.addr {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let (local, remote) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        self.incoming
            .send(remote)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(local)
    }
}

/// Responder side of the loopback transport
#[derive(Debug)]
pub struct MemoryAcceptor {
    addr: SocketAddr,
    incoming: mpsc::Receiver<DuplexStream>,
}

impl Acceptor for MemoryAcceptor {
    type Stream = DuplexStream;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn accept(&mut self) -> io::Result<(DuplexStream, SocketAddr)> {
        match self.incoming.recv().await {
            Some(stream) => Ok((stream, self.addr)),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}
