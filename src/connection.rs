//! Connection registry with strong/weak ownership discipline.
//!
//! The [`ConnectionManager`] holds the sole strong reference to each
//! [`Connection`]; consumers hold weak handles and upgrade on use. Once the
//! manager drops its strong reference, upgrades fail and operations surface
//! `ConnectionRemoved`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::transport::{Provider, ProviderEndpoint};
use crate::NodeId;

/// A connection to one remote peer.
///
/// Carries the provider endpoint and a `broken` flag. Once flagged broken,
/// every subsequent operation fails with `ConnectionBroken`.
pub struct Connection {
    remote_id: NodeId,
    endpoint: Box<dyn ProviderEndpoint>,
    broken: AtomicBool,
}

impl Connection {
    fn new(remote_id: NodeId, endpoint: Box<dyn ProviderEndpoint>) -> Self {
        Self {
            remote_id,
            endpoint,
            broken: AtomicBool::new(false),
        }
    }

    /// The peer this connection is bound to.
    pub fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    /// Whether the connection has been flagged unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Issue a one-sided write over this connection.
    ///
    /// Fails with `ConnectionBroken` if the connection is flagged, or if the
    /// provider rejects the transfer (the connection is then flagged as a
    /// side effect). Returns `true` on success.
    pub fn write_remote(
        &self,
        local_addr: u64,
        lkey: u64,
        remote_addr: u64,
        rkey: u64,
        size: usize,
        with_completion: bool,
    ) -> Result<bool> {
        if self.is_broken() {
            return Err(Error::ConnectionBroken(self.remote_id));
        }
        match self
            .endpoint
            .write_remote(local_addr, lkey, remote_addr, rkey, size, with_completion)
        {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(remote_id = self.remote_id, error = %e, "remote write failed");
                self.mark_broken();
                Err(Error::ConnectionBroken(self.remote_id))
            }
        }
    }
}

/// Process-wide connection registry.
///
/// Creates connections lazily on first [`get`](Self::get) and hands out weak
/// references.
pub struct ConnectionManager {
    provider: Arc<dyn Provider>,
    known: BTreeSet<NodeId>,
    inner: Mutex<HashMap<NodeId, Arc<Connection>>>,
}

impl ConnectionManager {
    pub(crate) fn new(provider: Arc<dyn Provider>, known: BTreeSet<NodeId>) -> Self {
        Self {
            provider,
            known,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Get a weak handle to the connection for `remote`.
    ///
    /// Lazily constructs the connection if the peer is known. For an unknown
    /// peer, or when endpoint creation fails, the returned handle fails to
    /// upgrade.
    pub fn get(&self, remote: NodeId) -> Weak<Connection> {
        let mut map = self.inner.lock().unwrap();
        if let Some(conn) = map.get(&remote) {
            return Arc::downgrade(conn);
        }
        if !self.known.contains(&remote) {
            return Weak::new();
        }
        match self.provider.endpoint(remote) {
            Ok(endpoint) => {
                let conn = Arc::new(Connection::new(remote, endpoint));
                let weak = Arc::downgrade(&conn);
                map.insert(remote, conn);
                tracing::debug!(remote_id = remote, "connection established");
                weak
            }
            Err(e) => {
                tracing::warn!(remote_id = remote, error = %e, "endpoint creation failed");
                Weak::new()
            }
        }
    }

    /// Flag the connection to `remote` broken. Weak handles still upgrade
    /// until [`remove`](Self::remove) drops the strong reference.
    pub fn mark_broken(&self, remote: NodeId) {
        let map = self.inner.lock().unwrap();
        if let Some(conn) = map.get(&remote) {
            conn.mark_broken();
            tracing::warn!(remote_id = remote, "connection marked broken");
        }
    }

    /// Drop the strong reference to `remote`; outstanding weak handles fail
    /// to upgrade from here on.
    pub fn remove(&self, remote: NodeId) {
        let mut map = self.inner.lock().unwrap();
        if map.remove(&remote).is_some() {
            tracing::debug!(remote_id = remote, "connection removed");
        }
    }

    /// Flag every connection broken, then drop all strong references.
    pub fn shutdown(&self) {
        let mut map = self.inner.lock().unwrap();
        for conn in map.values() {
            conn.mark_broken();
        }
        map.clear();
    }
}

/// Upgrade a weak connection handle, surfacing `ConnectionRemoved` when the
/// manager no longer holds the peer.
pub(crate) fn upgrade(conn: &Weak<Connection>, remote: NodeId) -> Result<Arc<Connection>> {
    conn.upgrade().ok_or(Error::ConnectionRemoved(remote))
}
