//! The shared state table.
//!
//! A table is one row per group member, each row a fixed sequence of typed
//! fields declared once at creation. The row at the local rank is written by
//! this process and published to every peer's mirror with one-sided remote
//! writes; all other rows are mirrors updated by their owners. Field access
//! is volatile at the element width, so mirror updates become visible to
//! concurrently polling readers.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::memory_region::MemoryRegion;
use crate::predicates::{self, Predicates};
use crate::transport::TransportContext;
use crate::NodeId;

/// Types usable as table fields: fixed-width, plain-copy values.
pub trait FieldValue: Copy + Send + 'static {}

impl FieldValue for bool {}
impl FieldValue for u8 {}
impl FieldValue for u16 {}
impl FieldValue for u32 {}
impl FieldValue for u64 {}
impl FieldValue for i8 {}
impl FieldValue for i16 {}
impl FieldValue for i32 {}
impl FieldValue for i64 {}
impl FieldValue for f32 {}
impl FieldValue for f64 {}

/// A typed scalar slot within a row. Handles are cheap copies carrying the
/// field's byte offset; the offset is identical in every peer's row, since
/// all peers declare the same layout in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FieldValue> Field<T> {
    /// Byte offset of this field within a row.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A typed fixed-length vector slot within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorField<T> {
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FieldValue> VectorField<T> {
    /// Byte offset of this field within a row.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector has zero elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Declares the row layout by enumerating fields in a fixed order.
///
/// Each field occupies the next offset aligned for its element type; the
/// final stride is rounded up to 8 bytes.
pub struct LayoutBuilder {
    offset: usize,
}

impl LayoutBuilder {
    /// Start an empty layout.
    pub fn new() -> Self {
        Self { offset: 0 }
    }

    /// Declare the next scalar field.
    pub fn field<T: FieldValue>(&mut self) -> Field<T> {
        self.offset = align_up(self.offset, mem::align_of::<T>());
        let field = Field {
            offset: self.offset,
            _marker: PhantomData,
        };
        self.offset += mem::size_of::<T>();
        field
    }

    /// Declare the next vector field of `len` elements.
    pub fn vector_field<T: FieldValue>(&mut self, len: usize) -> VectorField<T> {
        self.offset = align_up(self.offset, mem::align_of::<T>());
        let field = VectorField {
            offset: self.offset,
            len,
            _marker: PhantomData,
        };
        self.offset += mem::size_of::<T>() * len;
        field
    }

    /// Finish the declaration.
    pub fn finish(self) -> RowLayout {
        RowLayout {
            stride: align_up(self.offset.max(1), 8),
        }
    }
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A finished row layout.
#[derive(Debug, Clone, Copy)]
pub struct RowLayout {
    stride: usize,
}

impl RowLayout {
    /// Row width in bytes.
    pub fn row_size(&self) -> usize {
        self.stride
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// 8-byte-aligned zeroed backing store for the rows. Mirror bytes are
/// written by remote peers through the provider, so all access goes through
/// raw pointers and volatile operations.
struct TableBuffer {
    cells: Box<[UnsafeCell<u64>]>,
}

// Safety: all reads and writes of the buffer go through volatile raw-pointer
// operations; element-width atomicity is the documented granularity.
unsafe impl Send for TableBuffer {}
unsafe impl Sync for TableBuffer {}

impl TableBuffer {
    fn zeroed(len_bytes: usize) -> Self {
        let words = (len_bytes + 7) / 8;
        Self {
            cells: (0..words).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    fn base(&self) -> *mut u8 {
        self.cells.as_ptr() as *mut u8
    }
}

/// Shared state of one table instance: rows, per-peer regions, liveness,
/// and the predicate registry. Predicate triggers and actions receive
/// `&SstTable`; [`Sst`] derefs to it.
pub struct SstTable {
    ctx: Arc<TransportContext>,
    members: Vec<NodeId>,
    local_rank: usize,
    layout: RowLayout,
    // Regions are declared before the row buffer so they deregister before
    // the backing store is freed.
    regions: Vec<Option<MemoryRegion>>,
    rows: TableBuffer,
    live: Vec<AtomicBool>,
    failed: Vec<AtomicBool>,
    predicates: Predicates,
    shutdown: AtomicBool,
    failure_upcall: Mutex<Option<Box<dyn Fn(NodeId) + Send>>>,
}

impl SstTable {
    /// Current members in rank order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.members.len()
    }

    /// This process's row rank, fixed for the table's lifetime.
    pub fn get_local_index(&self) -> usize {
        self.local_rank
    }

    /// The member id owning `row`.
    pub fn member_id(&self, row: usize) -> NodeId {
        self.members[row]
    }

    /// Rank of the member with id `id`, if it is a member.
    pub fn rank_of(&self, id: NodeId) -> Option<usize> {
        self.members.binary_search(&id).ok()
    }

    /// Whether the member owning `row` is currently considered live. Failed
    /// rows keep returning their last observed values; callers gate on this
    /// bitmap.
    pub fn is_live(&self, row: usize) -> bool {
        self.live[row].load(Ordering::Acquire)
    }

    /// Ids of the members currently considered live.
    pub fn live_members(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .enumerate()
            .filter(|&(rank, _)| self.is_live(rank))
            .map(|(_, &id)| id)
            .collect()
    }

    /// The transport context backing this table.
    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// The predicate registry of this table instance.
    pub fn predicates(&self) -> &Predicates {
        &self.predicates
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn cell_ptr(&self, row: usize, offset: usize) -> *mut u8 {
        debug_assert!(row < self.members.len());
        debug_assert!(offset < self.layout.stride);
        unsafe { self.rows.base().add(row * self.layout.stride + offset) }
    }

    /// Read a field from any row. Atomic at the element width; wider state
    /// spanning several fields may be observed mid-update.
    pub fn read<T: FieldValue>(&self, field: Field<T>, row: usize) -> T {
        assert!(row < self.members.len(), "row {} out of range", row);
        fence(Ordering::Acquire);
        unsafe { ptr::read_volatile(self.cell_ptr(row, field.offset) as *const T) }
    }

    /// Write a field of the local row. Writing any other row is a
    /// programming error: the mirror rows belong to their owners.
    pub fn write<T: FieldValue>(&self, field: Field<T>, row: usize, value: T) {
        assert!(
            row == self.local_rank,
            "row {} is not writable from rank {}: only the local row may be written",
            row,
            self.local_rank
        );
        unsafe { ptr::write_volatile(self.cell_ptr(row, field.offset) as *mut T, value) }
    }

    /// Read one element of a vector field from any row.
    pub fn read_vec<T: FieldValue>(&self, field: VectorField<T>, row: usize, index: usize) -> T {
        assert!(row < self.members.len(), "row {} out of range", row);
        assert!(index < field.len, "index {} out of range", index);
        fence(Ordering::Acquire);
        let offset = field.offset + index * mem::size_of::<T>();
        unsafe { ptr::read_volatile(self.cell_ptr(row, offset) as *const T) }
    }

    /// Write one element of a vector field of the local row.
    pub fn write_vec<T: FieldValue>(
        &self,
        field: VectorField<T>,
        row: usize,
        index: usize,
        value: T,
    ) {
        assert!(
            row == self.local_rank,
            "row {} is not writable from rank {}: only the local row may be written",
            row,
            self.local_rank
        );
        assert!(index < field.len, "index {} out of range", index);
        let offset = field.offset + index * mem::size_of::<T>();
        unsafe { ptr::write_volatile(self.cell_ptr(row, offset) as *mut T, value) }
    }

    /// Publish the whole local row to every live peer's mirror, without
    /// waiting for completion.
    pub fn put(&self) -> Result<()> {
        self.put_range(0, self.layout.stride, false)
    }

    /// Publish the byte range of one scalar field of the local row.
    pub fn put_field<T: FieldValue>(&self, field: Field<T>) -> Result<()> {
        self.put_range(field.offset, mem::size_of::<T>(), false)
    }

    /// Publish the byte range of one vector field of the local row.
    pub fn put_vector_field<T: FieldValue>(&self, field: VectorField<T>) -> Result<()> {
        self.put_range(field.offset, mem::size_of::<T>() * field.len, false)
    }

    /// Publish one scalar field and wait for transport-level completion.
    pub fn put_with_completion<T: FieldValue>(&self, field: Field<T>) -> Result<()> {
        self.put_range(field.offset, mem::size_of::<T>(), true)
    }

    /// Publish a byte range of the local row to every live peer's mirror.
    pub fn put_range(&self, offset: usize, len: usize, with_completion: bool) -> Result<()> {
        assert!(len > 0 && offset + len <= self.layout.stride);
        let row_base = self.local_rank * self.layout.stride + offset;
        for (rank, region) in self.regions.iter().enumerate() {
            let region = match region {
                Some(region) => region,
                None => continue,
            };
            if !self.is_live(rank) {
                continue;
            }
            region.write_remote(row_base, len, with_completion)?;
        }
        Ok(())
    }

    /// Two-way rendezvous with every live member; returns once all of them
    /// have reached the same call.
    pub fn sync_with_members(&self) -> Result<()> {
        for (rank, region) in self.regions.iter().enumerate() {
            let region = match region {
                Some(region) => region,
                None => continue,
            };
            if !self.is_live(rank) {
                continue;
            }
            region.sync()?;
        }
        Ok(())
    }

    /// Classify the member owning `rank` as failed: mark its connection
    /// broken, clear its liveness bit, and fire the failure upcall. At most
    /// once per member.
    pub(crate) fn report_failure(&self, rank: usize) {
        if self.failed[rank].swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.members[rank];
        self.ctx.connections().mark_broken(id);
        self.live[rank].store(false, Ordering::Release);
        tracing::warn!(remote_id = id, "peer classified as failed");
        let upcall = self.failure_upcall.lock().unwrap();
        if let Some(cb) = upcall.as_ref() {
            cb(id);
        }
    }
}

/// A shared state table instance: owns the shared state plus the predicate
/// and failure worker threads. Derefs to [`SstTable`] for all table
/// operations.
pub struct Sst {
    core: Arc<SstTable>,
    workers: Vec<JoinHandle<()>>,
    failure_enabled: bool,
}

impl Deref for Sst {
    type Target = SstTable;

    fn deref(&self) -> &SstTable {
        &self.core
    }
}

impl Sst {
    /// Create a table over the context's members with the given row layout.
    ///
    /// Establishes a memory region to every peer (the table buffer serves as
    /// both send and receive buffer, as each side writes its own row and
    /// mirrors the others) and starts the predicate worker.
    pub fn new(ctx: &Arc<TransportContext>, layout: RowLayout) -> Result<Sst> {
        let members = ctx.config().members();
        let local_id = ctx.local_id();
        let local_rank = members
            .iter()
            .position(|&id| id == local_id)
            .ok_or_else(|| {
                crate::error::Error::InvalidConfig(format!(
                    "local id {} is not a member",
                    local_id
                ))
            })?;

        let table_size = layout.stride * members.len();
        let rows = TableBuffer::zeroed(table_size);

        let mut regions = Vec::with_capacity(members.len());
        for (rank, &id) in members.iter().enumerate() {
            if rank == local_rank {
                regions.push(None);
                continue;
            }
            // Safety: the buffer lives in the SstTable alongside the
            // regions and is dropped after them.
            let region =
                unsafe { MemoryRegion::new(ctx, id, rows.base(), rows.base(), table_size)? };
            regions.push(Some(region));
        }

        let n = members.len();
        let core = Arc::new(SstTable {
            ctx: ctx.clone(),
            members,
            local_rank,
            layout,
            regions,
            rows,
            live: (0..n).map(|_| AtomicBool::new(true)).collect(),
            failed: (0..n).map(|_| AtomicBool::new(false)).collect(),
            predicates: Predicates::new(),
            shutdown: AtomicBool::new(false),
            failure_upcall: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        let interval = ctx.config().predicate_poll_interval;
        let predicate_worker = thread::Builder::new()
            .name("predicates".into())
            .spawn(move || predicates::scan_loop(weak, interval))
            .map_err(crate::error::Error::Io)?;

        Ok(Sst {
            core,
            workers: vec![predicate_worker],
            failure_enabled: false,
        })
    }

    /// Start heartbeat-based failure detection.
    ///
    /// The worker periodically bumps the local `heartbeat` counter and
    /// publishes it with completion; a peer is classified as failed when the
    /// publish fails with a connection error or when the peer's own
    /// heartbeat stops advancing for longer than the liveness window. On
    /// failure the upcall runs with the failed peer's id.
    pub fn enable_failure_detection(
        &mut self,
        heartbeat: Field<u64>,
        upcall: impl Fn(NodeId) + Send + 'static,
    ) -> Result<()> {
        assert!(!self.failure_enabled, "failure detection already enabled");
        self.failure_enabled = true;
        *self.core.failure_upcall.lock().unwrap() = Some(Box::new(upcall));

        let weak = Arc::downgrade(&self.core);
        let interval = self.core.ctx.config().heartbeat_interval;
        let window = self.core.ctx.config().liveness_window;
        let n = self.core.members.len();
        let worker = thread::Builder::new()
            .name("check_failures".into())
            .spawn(move || check_failures_loop(weak, heartbeat, interval, window, n))
            .map_err(crate::error::Error::Io)?;
        self.workers.push(worker);
        Ok(())
    }
}

impl Drop for Sst {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn check_failures_loop(
    table: Weak<SstTable>,
    heartbeat: Field<u64>,
    interval: Duration,
    window: Duration,
    n: usize,
) {
    tracing::debug!("failure worker started");
    let mut last_seen = vec![0u64; n];
    let mut last_change = vec![Instant::now(); n];
    loop {
        thread::sleep(interval);
        let core = match table.upgrade() {
            Some(core) => core,
            None => break,
        };
        if core.shutdown_requested() {
            break;
        }

        let me = core.get_local_index();
        let beat = core.read(heartbeat, me);
        core.write(heartbeat, me, beat.wrapping_add(1));
        if let Err(e) = core.put_with_completion(heartbeat) {
            if let Some(id) = e.peer() {
                if let Some(rank) = core.rank_of(id) {
                    core.report_failure(rank);
                }
            }
        }

        let now = Instant::now();
        for rank in 0..n {
            if rank == me || !core.is_live(rank) {
                continue;
            }
            let seen = core.read(heartbeat, rank);
            if seen != last_seen[rank] {
                last_seen[rank] = seen;
                last_change[rank] = now;
            } else if now.duration_since(last_change[rank]) > window {
                core.report_failure(rank);
            }
        }
    }
    tracing::debug!("failure worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SstConfig;
    use crate::shmem::ShmProvider;

    #[test]
    fn test_layout_offsets_and_stride() {
        let mut layout = LayoutBuilder::new();
        let a = layout.field::<u8>();
        let b = layout.field::<u64>();
        let c = layout.field::<u32>();
        let v = layout.vector_field::<u16>(3);
        let layout = layout.finish();

        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8); // aligned past the u8
        assert_eq!(c.offset(), 16);
        assert_eq!(v.offset(), 20);
        assert_eq!(v.len(), 3);
        assert_eq!(layout.row_size(), 32); // 26 rounded up to 8
    }

    fn single_node_table(port: u16) -> Sst {
        let config = SstConfig::new()
            .with_local_id(1)
            .with_peer(1, format!("127.0.0.1:{}", port).parse().unwrap());
        let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();
        let mut layout = LayoutBuilder::new();
        let _counter = layout.field::<u64>();
        Sst::new(&ctx, layout.finish()).unwrap()
    }

    #[test]
    fn test_local_read_write_roundtrip() {
        let config = SstConfig::new()
            .with_local_id(1)
            .with_peer(1, "127.0.0.1:47421".parse().unwrap());
        let ctx = TransportContext::initialize(&config, Arc::new(ShmProvider::new())).unwrap();

        let mut layout = LayoutBuilder::new();
        let counter = layout.field::<u64>();
        let flag = layout.field::<bool>();
        let vec_field = layout.vector_field::<u32>(4);
        let sst = Sst::new(&ctx, layout.finish()).unwrap();

        let me = sst.get_local_index();
        assert_eq!(me, 0);
        assert_eq!(sst.members(), &[1]);
        assert_eq!(sst.read(counter, me), 0);

        sst.write(counter, me, 42);
        sst.write(flag, me, true);
        sst.write_vec(vec_field, me, 2, 7);

        assert_eq!(sst.read(counter, me), 42);
        assert!(sst.read(flag, me));
        assert_eq!(sst.read_vec(vec_field, me, 2), 7);
        assert_eq!(sst.read_vec(vec_field, me, 3), 0);

        // No peers: put and sync are trivially complete.
        sst.put().unwrap();
        sst.put_field(counter).unwrap();
        sst.sync_with_members().unwrap();
    }

    #[test]
    #[should_panic(expected = "only the local row may be written")]
    fn test_remote_row_write_rejected() {
        let sst = single_node_table(47422);
        let mut layout = LayoutBuilder::new();
        let counter = layout.field::<u64>();
        let _ = layout.finish();
        sst.write(counter, 1, 99);
    }

    #[test]
    fn test_rank_lookup() {
        let sst = single_node_table(47423);
        assert_eq!(sst.rank_of(1), Some(0));
        assert_eq!(sst.rank_of(9), None);
        assert_eq!(sst.member_id(0), 1);
        assert_eq!(sst.live_members(), vec![1]);
    }
}
