//! Per-peer registered memory regions.
//!
//! A [`MemoryRegion`] pairs a send and a receive buffer registered with the
//! transport provider, exchanges a 16-byte descriptor with its peer over the
//! TCP side channel, and then serves one-sided writes from the send buffer
//! into the peer's receive buffer.

use std::io;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::connection::{self, Connection};
use crate::error::Result;
use crate::transport::{AccessFlags, Provider, RegisteredMemory, TransportContext};
use crate::NodeId;

/// Size of the descriptor exchanged once per region.
pub const MR_EXCHANGE_RECORD_SIZE: usize = 16;

/// Wire record exchanged when a region is established: the receive buffer's
/// key and virtual address, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrExchangeRecord {
    /// Remote key of the receive buffer.
    pub mr_key: u64,
    /// Virtual address of the receive buffer.
    pub vaddr: u64,
}

impl MrExchangeRecord {
    /// Encode into network byte order.
    pub fn encode(&self) -> [u8; MR_EXCHANGE_RECORD_SIZE] {
        let mut buf = [0u8; MR_EXCHANGE_RECORD_SIZE];
        buf[..8].copy_from_slice(&self.mr_key.to_be_bytes());
        buf[8..].copy_from_slice(&self.vaddr.to_be_bytes());
        buf
    }

    /// Decode from network byte order.
    pub fn decode(buf: &[u8; MR_EXCHANGE_RECORD_SIZE]) -> Self {
        let mut key = [0u8; 8];
        let mut vaddr = [0u8; 8];
        key.copy_from_slice(&buf[..8]);
        vaddr.copy_from_slice(&buf[8..]);
        Self {
            mr_key: u64::from_be_bytes(key),
            vaddr: u64::from_be_bytes(vaddr),
        }
    }
}

/// A pair of registered buffers bound to exactly one remote peer.
pub struct MemoryRegion {
    ctx: Arc<TransportContext>,
    remote_id: NodeId,
    connection: Weak<Connection>,
    send_buf: *mut u8,
    size: usize,
    send_mr: Box<dyn RegisteredMemory>,
    _recv_mr: Box<dyn RegisteredMemory>,
    remote_key: u64,
    remote_recv_addr: u64,
}

// Safety: the raw buffer pointers are only dereferenced by the provider,
// which serializes access; the rest of the state is immutable after
// construction.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Establish a region toward `remote_id` over `size`-byte send and
    /// receive buffers.
    ///
    /// Registers both buffers (retrying transient failures, crashing on any
    /// other registration failure), then performs the symmetric 16-byte
    /// descriptor exchange over the side channel.
    ///
    /// # Safety
    ///
    /// `send_buf` and `recv_buf` must each point to `size` bytes that stay
    /// live and writable for the lifetime of the region. The two may alias
    /// (a table that is both published and mirrored uses one buffer for
    /// both roles).
    pub unsafe fn new(
        ctx: &Arc<TransportContext>,
        remote_id: NodeId,
        send_buf: *mut u8,
        recv_buf: *mut u8,
        size: usize,
    ) -> Result<Self> {
        let connection = ctx.connections().get(remote_id);
        let conn = connection::upgrade(&connection, remote_id)?;
        if conn.is_broken() {
            return Err(crate::error::Error::ConnectionBroken(remote_id));
        }

        let access = AccessFlags::all();
        let send_mr = register_with_retry(ctx.provider(), send_buf, size, access, "send buffer");
        let recv_mr = register_with_retry(ctx.provider(), recv_buf, size, access, "receive buffer");

        let local = MrExchangeRecord {
            mr_key: recv_mr.lkey(),
            vaddr: recv_buf as u64,
        };
        let mut wire = [0u8; MR_EXCHANGE_RECORD_SIZE];
        ctx.exchange(remote_id, &local.encode(), &mut wire)?;
        let remote = MrExchangeRecord::decode(&wire);
        tracing::debug!(
            remote_id,
            remote_key = remote.mr_key,
            "memory region established"
        );

        Ok(Self {
            ctx: ctx.clone(),
            remote_id,
            connection,
            send_buf,
            size,
            send_mr,
            _recv_mr: recv_mr,
            remote_key: remote.mr_key,
            remote_recv_addr: remote.vaddr,
        })
    }

    /// The peer this region is bound to.
    pub fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One-sided write of `size` bytes at `offset` from the send buffer into
    /// the peer's receive buffer at the same offset.
    ///
    /// `offset + size` must not exceed the region size. Returns `true` on
    /// success; failure is one of the two connection errors.
    pub fn write_remote(&self, offset: usize, size: usize, with_completion: bool) -> Result<bool> {
        let conn = connection::upgrade(&self.connection, self.remote_id)?;
        assert!(
            offset + size <= self.size,
            "remote write [{}, {}) exceeds region size {}",
            offset,
            offset + size,
            self.size
        );
        conn.write_remote(
            self.send_buf as u64 + offset as u64,
            self.send_mr.lkey(),
            self.remote_recv_addr + offset as u64,
            self.remote_key,
            size,
            with_completion,
        )
    }

    /// Rendezvous with the peer: returns `true` once both sides have
    /// entered the call and the side channel round trip confirmed the peer
    /// alive.
    pub fn sync(&self) -> Result<bool> {
        connection::upgrade(&self.connection, self.remote_id)?;
        self.ctx.rendezvous(self.remote_id)?;
        Ok(true)
    }
}

/// Register a buffer, retrying transient resource exhaustion with backoff.
/// Any other failure is fatal.
fn register_with_retry(
    provider: &Arc<dyn Provider>,
    addr: *mut u8,
    len: usize,
    access: AccessFlags,
    what: &str,
) -> Box<dyn RegisteredMemory> {
    let mut backoff = Duration::from_millis(1);
    loop {
        match unsafe { provider.register(addr, len, access) } {
            Ok(mr) => return mr,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::warn!(error = %e, "transient registration failure for {}, retrying", what);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(100));
            }
            Err(e) => panic!("failed to register {}: {}", what, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SstConfig;
    use crate::shmem::ShmProvider;
    use std::collections::BTreeMap;

    #[test]
    fn test_exchange_record_big_endian_layout() {
        let record = MrExchangeRecord {
            mr_key: 0x0102_0304_0506_0708,
            vaddr: 0x1112_1314_1516_1718,
        };
        let wire = record.encode();
        assert_eq!(wire[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(wire[8..], [0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
        assert_eq!(MrExchangeRecord::decode(&wire), record);
    }

    fn pair_configs(base_port: u16) -> (SstConfig, SstConfig) {
        let mut peers = BTreeMap::new();
        peers.insert(1, format!("127.0.0.1:{}", base_port).parse().unwrap());
        peers.insert(2, format!("127.0.0.1:{}", base_port + 1).parse().unwrap());
        (
            SstConfig::new().with_local_id(1).with_peers(peers.clone()),
            SstConfig::new().with_local_id(2).with_peers(peers),
        )
    }

    /// Two in-process peers establish regions over 4096-byte buffers; the
    /// write at the exact boundary succeeds, one byte past it panics.
    #[test]
    fn test_write_remote_bounds() {
        let (c1, c2) = pair_configs(47411);

        let peer = std::thread::spawn(move || {
            let ctx = TransportContext::initialize(&c2, Arc::new(ShmProvider::new())).unwrap();
            let mut send = vec![0u8; 4096];
            let mut recv = vec![0u8; 4096];
            let region = unsafe {
                MemoryRegion::new(&ctx, 1, send.as_mut_ptr(), recv.as_mut_ptr(), 4096).unwrap()
            };
            // Hold the buffers until the writer is done.
            region.sync().unwrap();
        });

        let ctx = TransportContext::initialize(&c1, Arc::new(ShmProvider::new())).unwrap();
        let mut send = vec![0u8; 4096];
        let mut recv = vec![0u8; 4096];
        let region =
            unsafe { MemoryRegion::new(&ctx, 2, send.as_mut_ptr(), recv.as_mut_ptr(), 4096).unwrap() };

        assert!(region.write_remote(4080, 16, false).unwrap());

        let oob = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = region.write_remote(4081, 16, false);
        }));
        assert!(oob.is_err(), "out-of-bounds write must be rejected");

        region.sync().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_write_remote_after_removal() {
        let (c1, c2) = pair_configs(47413);

        let peer = std::thread::spawn(move || {
            let ctx = TransportContext::initialize(&c2, Arc::new(ShmProvider::new())).unwrap();
            let mut send = vec![0u8; 64];
            let mut recv = vec![0u8; 64];
            let region = unsafe {
                MemoryRegion::new(&ctx, 1, send.as_mut_ptr(), recv.as_mut_ptr(), 64).unwrap()
            };
            region.sync().unwrap();
        });

        let ctx = TransportContext::initialize(&c1, Arc::new(ShmProvider::new())).unwrap();
        let mut send = vec![0u8; 64];
        let mut recv = vec![0u8; 64];
        let region =
            unsafe { MemoryRegion::new(&ctx, 2, send.as_mut_ptr(), recv.as_mut_ptr(), 64).unwrap() };
        region.sync().unwrap();
        peer.join().unwrap();

        ctx.connections().remove(2);
        assert!(matches!(
            region.write_remote(0, 8, false),
            Err(crate::error::Error::ConnectionRemoved(2))
        ));
    }
}
