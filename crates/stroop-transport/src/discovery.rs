//! Peer discovery collaborators
//!
//! The responder advertises the address it listens on under a service
//! name; the initiator resolves that name to an address before each
//! connection attempt.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use stroop_core::TransportError;

/// Service advertisement and lookup
pub trait Discovery: Send + Sync + 'static {
    /// Make `addr` reachable under `name`
    fn advertise(
        &self,
        name: &str,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Resolve `name` to a peer address
    fn discover(&self, name: &str) -> impl Future<Output = Result<SocketAddr, TransportError>> + Send;
}

/// Fixed peer address (manual pairing)
#[derive(Clone, Copy, Debug)]
pub struct StaticDiscovery {
    addr: SocketAddr,
}

impl StaticDiscovery {
    pub fn new(addr: SocketAddr) -> Self {
        StaticDiscovery { addr }
    }
}

impl Discovery for StaticDiscovery {
    async fn advertise(&self, _name: &str, _addr: SocketAddr) -> Result<(), TransportError> {
        Ok(())
    }

    async fn discover(&self, _name: &str) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }
}

/// In-process service registry
///
/// `discover` waits until the name is advertised. Clones share the
/// registry, so both nodes of a loopback pair can hold one.
#[derive(Clone, Default)]
pub struct LocalDiscovery {
    inner: Arc<LocalRegistry>,
}

#[derive(Default)]
struct LocalRegistry {
    services: Mutex<HashMap<String, SocketAddr>>,
    changed: Notify,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an advertisement
    pub fn withdraw(&self, name: &str) -> Option<SocketAddr> {
        self.inner.services.lock().remove(name)
    }

    /// Current advertisement, without waiting
    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.inner.services.lock().get(name).copied()
    }
}

impl Discovery for LocalDiscovery {
    async fn advertise(&self, name: &str, addr: SocketAddr) -> Result<(), TransportError> {
        self.inner.services.lock().insert(name.to_string(), addr);
        self.inner.changed.notify_waiters();
        tracing::debug!(name, %addr, "Service advertised");
        Ok(())
    }

    async fn discover(&self, name: &str) -> Result<SocketAddr, TransportError> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before checking so an advertise in between is not missed
            notified.as_mut().enable();

            if let Some(addr) = self.lookup(name) {
                return Ok(addr);
            }
            notified.await;
        }
    }
}
