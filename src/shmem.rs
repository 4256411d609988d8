//! Process-local shared-memory provider.
//!
//! Implements the provider seam for peers that live in the same address
//! space: the "remote virtual address" carried by the exchange record is a
//! real address in this process, and a one-sided write is a volatile copy
//! into it. Useful for tests and single-host deployments; hardware verbs
//! backends implement the same traits externally.
//!
//! A process-global registration table maps provider-assigned keys to the
//! registered address ranges. Writes validate the remote key and bounds
//! under the table lock, so a write can never land in a buffer whose
//! registration has been dropped.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::transport::{AccessFlags, Provider, ProviderEndpoint, RegisteredMemory};
use crate::NodeId;

struct Registration {
    addr: u64,
    len: usize,
}

fn registry() -> &'static Mutex<HashMap<u64, Registration>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Registration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_key() -> u64 {
    static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

/// Process-local shared-memory provider.
#[derive(Debug, Default)]
pub struct ShmProvider;

impl ShmProvider {
    /// Create a new provider instance.
    pub fn new() -> Self {
        Self
    }
}

impl Provider for ShmProvider {
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        _access: AccessFlags,
    ) -> io::Result<Box<dyn RegisteredMemory>> {
        if addr.is_null() || len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot register an empty buffer",
            ));
        }
        let key = next_key();
        registry().lock().unwrap().insert(
            key,
            Registration {
                addr: addr as u64,
                len,
            },
        );
        Ok(Box::new(ShmRegion {
            addr: addr as u64,
            len,
            key,
        }))
    }

    fn endpoint(&self, remote: NodeId) -> io::Result<Box<dyn ProviderEndpoint>> {
        Ok(Box::new(ShmEndpoint { remote }))
    }
}

struct ShmRegion {
    addr: u64,
    len: usize,
    key: u64,
}

impl RegisteredMemory for ShmRegion {
    fn lkey(&self) -> u64 {
        self.key
    }

    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        registry().lock().unwrap().remove(&self.key);
    }
}

struct ShmEndpoint {
    remote: NodeId,
}

impl ProviderEndpoint for ShmEndpoint {
    fn write_remote(
        &self,
        local_addr: u64,
        _lkey: u64,
        remote_addr: u64,
        rkey: u64,
        size: usize,
        _with_completion: bool,
    ) -> io::Result<()> {
        // The copy runs under the table lock so the target registration
        // cannot be dropped mid-transfer. Completion is synchronous here.
        let table = registry().lock().unwrap();
        let reg = table.get(&rkey).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("remote key {} of node {} is not registered", rkey, self.remote),
            )
        })?;
        let end = remote_addr
            .checked_add(size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address overflow"))?;
        if remote_addr < reg.addr || end > reg.addr + reg.len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "remote write [{:#x}, {:#x}) outside registration of node {}",
                    remote_addr, end, self.remote
                ),
            ));
        }

        // Safety: the source is a registered local buffer per the Provider
        // contract; the destination range was validated against a live
        // registration above.
        unsafe {
            volatile_copy(remote_addr as *mut u8, local_addr as *const u8, size);
        }
        fence(Ordering::Release);
        Ok(())
    }
}

/// Copy `len` bytes with volatile stores, in the widest chunks the current
/// alignment admits. Aligned chunk stores keep single-element updates
/// indivisible at the element width.
///
/// # Safety
///
/// `src` and `dst` must be valid for `len` bytes and must not overlap.
unsafe fn volatile_copy(mut dst: *mut u8, mut src: *const u8, mut len: usize) {
    while len >= 8 && (dst as usize) % 8 == 0 && (src as usize) % 8 == 0 {
        std::ptr::write_volatile(dst as *mut u64, std::ptr::read(src as *const u64));
        dst = dst.add(8);
        src = src.add(8);
        len -= 8;
    }
    while len >= 4 && (dst as usize) % 4 == 0 && (src as usize) % 4 == 0 {
        std::ptr::write_volatile(dst as *mut u32, std::ptr::read(src as *const u32));
        dst = dst.add(4);
        src = src.add(4);
        len -= 4;
    }
    while len > 0 {
        std::ptr::write_volatile(dst, std::ptr::read(src));
        dst = dst.add(1);
        src = src.add(1);
        len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_write() {
        let provider = ShmProvider::new();
        let mut src = vec![0u8; 64];
        let mut dst = vec![0u8; 64];

        let src_mr = unsafe {
            provider
                .register(src.as_mut_ptr(), src.len(), AccessFlags::all())
                .unwrap()
        };
        let dst_mr = unsafe {
            provider
                .register(dst.as_mut_ptr(), dst.len(), AccessFlags::all())
                .unwrap()
        };

        for (i, b) in src.iter_mut().enumerate() {
            *b = i as u8;
        }

        let ep = provider.endpoint(2).unwrap();
        ep.write_remote(src_mr.addr() + 8, src_mr.lkey(), dst_mr.addr() + 8, dst_mr.lkey(), 16, false)
            .unwrap();

        assert_eq!(&dst[..8], &[0u8; 8]);
        assert_eq!(&dst[8..24], &src[8..24]);
        assert_eq!(&dst[24..], &[0u8; 40]);
    }

    #[test]
    fn test_write_after_deregistration_fails() {
        let provider = ShmProvider::new();
        let mut src = vec![0u8; 32];
        let mut dst = vec![0u8; 32];

        let src_mr = unsafe {
            provider
                .register(src.as_mut_ptr(), src.len(), AccessFlags::all())
                .unwrap()
        };
        let dst_mr = unsafe {
            provider
                .register(dst.as_mut_ptr(), dst.len(), AccessFlags::all())
                .unwrap()
        };
        let dst_addr = dst_mr.addr();
        let dst_key = dst_mr.lkey();
        drop(dst_mr);

        let ep = provider.endpoint(2).unwrap();
        let err = ep
            .write_remote(src_mr.addr(), src_mr.lkey(), dst_addr, dst_key, 32, true)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_write_outside_registration_fails() {
        let provider = ShmProvider::new();
        let mut src = vec![0u8; 32];
        let mut dst = vec![0u8; 32];

        let src_mr = unsafe {
            provider
                .register(src.as_mut_ptr(), src.len(), AccessFlags::all())
                .unwrap()
        };
        let dst_mr = unsafe {
            provider
                .register(dst.as_mut_ptr(), dst.len(), AccessFlags::all())
                .unwrap()
        };

        let ep = provider.endpoint(2).unwrap();
        let err = ep
            .write_remote(src_mr.addr(), src_mr.lkey(), dst_mr.addr() + 17, dst_mr.lkey(), 16, false)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
