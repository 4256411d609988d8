//! Transport provider seam and process-wide transport state.
//!
//! The one-sided verbs provider is abstracted behind the [`Provider`] family
//! of traits; hardware backends plug in at [`TransportContext`] construction.
//! The crate bundles one implementation, [`crate::shmem::ShmProvider`], which
//! performs one-sided writes between peers living in the same process.
//!
//! [`TransportContext`] is the process-wide state: the full peer address
//! table, the TCP side channels used for memory-region descriptor exchange
//! and sync rendezvous, and the [`ConnectionManager`].

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::config::SstConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::NodeId;

bitflags! {
    /// Access permissions requested when registering a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_READ = 1;
        const LOCAL_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

/// A registered memory buffer.
///
/// Dropping the handle deregisters the buffer; remote writes targeting it
/// fail from that point on.
pub trait RegisteredMemory: Send + Sync {
    /// Provider-assigned local key.
    fn lkey(&self) -> u64;
    /// Base virtual address of the registered buffer.
    fn addr(&self) -> u64;
    /// Registered length in bytes.
    fn len(&self) -> usize;
}

/// A one-sided endpoint bound to a single remote peer.
pub trait ProviderEndpoint: Send + Sync {
    /// Issue a one-sided write of `size` bytes from the registered local
    /// buffer at `local_addr` into the peer's registered buffer at
    /// `remote_addr`.
    ///
    /// With `with_completion`, the call returns only once the transfer has
    /// been acknowledged by the provider; without it, the call returns as
    /// soon as the provider accepts the request. Writes from one origin to
    /// one destination are delivered in issue order.
    fn write_remote(
        &self,
        local_addr: u64,
        lkey: u64,
        remote_addr: u64,
        rkey: u64,
        size: usize,
        with_completion: bool,
    ) -> io::Result<()>;
}

/// A one-sided memory transport provider.
///
/// Registration failures of kind [`io::ErrorKind::WouldBlock`] are treated
/// as transient by callers and retried; any other registration failure is
/// fatal.
pub trait Provider: Send + Sync {
    /// Register `len` bytes at `addr` for the given access.
    ///
    /// Keys are provider-assigned.
    ///
    /// # Safety
    ///
    /// `addr` must point to `len` bytes that stay live and writable until
    /// the returned handle is dropped.
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<Box<dyn RegisteredMemory>>;

    /// Create an endpoint for one-sided writes toward `remote`.
    fn endpoint(&self, remote: NodeId) -> io::Result<Box<dyn ProviderEndpoint>>;
}

/// Process-wide transport state.
///
/// Initialized once with the full peer address table; establishes one TCP
/// side channel per peer (connect toward higher ids, accept from lower ids)
/// and owns the [`ConnectionManager`]. Torn down when the last reference is
/// dropped.
pub struct TransportContext {
    config: SstConfig,
    provider: Arc<dyn Provider>,
    connections: ConnectionManager,
    channels: BTreeMap<NodeId, Mutex<TcpStream>>,
    _listener: TcpListener,
}

impl TransportContext {
    /// Initialize the transport: bind the local side-channel port, connect
    /// to every configured peer, and set up the connection manager.
    ///
    /// Blocks until a side channel to every peer is established.
    pub fn initialize(config: &SstConfig, provider: Arc<dyn Provider>) -> Result<Arc<Self>> {
        config.validate()?;

        let local_id = config.local_id;
        let local_addr = config.peers[&local_id];
        let listener = TcpListener::bind(local_addr)?;
        tracing::debug!(local_id, %local_addr, "side channel listening");

        let mut channels = BTreeMap::new();

        // Connect toward higher ids first. The listener is already bound, so
        // peers connecting to us are queued in the accept backlog meanwhile.
        for (&id, &addr) in config.peers.range(local_id + 1..) {
            let stream = connect_with_retry(addr, config.connect_timeout)?;
            stream.set_nodelay(true)?;
            let mut stream = stream;
            stream.write_all(&local_id.to_be_bytes())?;
            tracing::debug!(local_id, remote_id = id, "side channel connected");
            channels.insert(id, Mutex::new(stream));
        }

        // Accept one stream per lower id; the 4-byte handshake identifies
        // the connecting peer.
        let expected_lower = config.peers.range(..local_id).count();
        for _ in 0..expected_lower {
            let (mut stream, _) = listener.accept()?;
            stream.set_nodelay(true)?;
            let mut id_buf = [0u8; 4];
            stream.read_exact(&mut id_buf)?;
            let id = NodeId::from_be_bytes(id_buf);
            if id >= local_id || !config.peers.contains_key(&id) || channels.contains_key(&id) {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected side-channel handshake from node {}", id),
                )));
            }
            tracing::debug!(local_id, remote_id = id, "side channel accepted");
            channels.insert(id, Mutex::new(stream));
        }

        let remote_ids = config
            .peers
            .keys()
            .copied()
            .filter(|&id| id != local_id)
            .collect();
        let connections = ConnectionManager::new(provider.clone(), remote_ids);

        Ok(Arc::new(Self {
            config: config.clone(),
            provider,
            connections,
            channels,
            _listener: listener,
        }))
    }

    /// This peer's identifier.
    pub fn local_id(&self) -> NodeId {
        self.config.local_id
    }

    /// The configuration this context was initialized with.
    pub fn config(&self) -> &SstConfig {
        &self.config
    }

    /// The transport provider.
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// The process-wide connection registry.
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Symmetric fixed-size exchange with a peer over the side channel:
    /// one send and one receive of the same record.
    pub fn exchange(&self, remote: NodeId, out: &[u8], inb: &mut [u8]) -> Result<()> {
        let channel = self
            .channels
            .get(&remote)
            .ok_or(Error::UnknownPeer(remote))?;
        let mut stream = channel.lock().unwrap();
        stream.write_all(out)?;
        stream.flush()?;
        stream.read_exact(inb)?;
        Ok(())
    }

    /// Two-way rendezvous with a peer: returns once both sides have entered
    /// the call.
    pub fn rendezvous(&self, remote: NodeId) -> Result<()> {
        let mut byte = [0u8; 1];
        self.exchange(remote, &[0xB1], &mut byte)
    }

    /// Flag every connection broken, then drop the manager's strong
    /// references.
    pub fn shutdown(&self) {
        self.connections.shutdown();
    }
}

fn connect_with_retry(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::ShmProvider;
    use std::collections::BTreeMap;

    fn pair_configs(base_port: u16) -> (SstConfig, SstConfig) {
        let mut peers = BTreeMap::new();
        peers.insert(1, format!("127.0.0.1:{}", base_port).parse().unwrap());
        peers.insert(2, format!("127.0.0.1:{}", base_port + 1).parse().unwrap());
        (
            SstConfig::new().with_local_id(1).with_peers(peers.clone()),
            SstConfig::new().with_local_id(2).with_peers(peers),
        )
    }

    #[test]
    fn test_pairwise_exchange() {
        let (c1, c2) = pair_configs(47401);

        let t = thread::spawn(move || {
            let ctx = TransportContext::initialize(&c2, Arc::new(ShmProvider::new())).unwrap();
            let mut got = [0u8; 4];
            ctx.exchange(1, &[5, 6, 7, 8], &mut got).unwrap();
            got
        });

        let ctx = TransportContext::initialize(&c1, Arc::new(ShmProvider::new())).unwrap();
        let mut got = [0u8; 4];
        ctx.exchange(2, &[1, 2, 3, 4], &mut got).unwrap();

        assert_eq!(got, [5, 6, 7, 8]);
        assert_eq!(t.join().unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_exchange_with_unknown_peer() {
        let (c1, c2) = pair_configs(47403);

        let t = thread::spawn(move || {
            TransportContext::initialize(&c2, Arc::new(ShmProvider::new())).unwrap()
        });
        let ctx = TransportContext::initialize(&c1, Arc::new(ShmProvider::new())).unwrap();
        let _peer = t.join().unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            ctx.exchange(9, &[0], &mut buf),
            Err(Error::UnknownPeer(9))
        ));
    }
}
