//! Reply tracking for outgoing RPCs.
//!
//! Each outgoing call yields a [`PendingResults`] / [`QueryResults`] pair:
//! the pending side is fulfilled with the set of peers actually contacted
//! and then with one value or error per responding peer; the query side
//! hands the caller one future per peer plus bulk wait. Failure of a peer
//! before it replies surfaces as a per-peer `NodeRemoved` error; the call
//! as a whole never fails.
//!
//! Every per-peer slot is a single-assignment cell guarded by a mutex and
//! condition variable; when a value and a removal race, the first assignment
//! wins and the second is ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::error::{Error, Result};
use crate::NodeId;

enum SlotState<T> {
    Empty,
    Ready(Result<T>),
    Consumed,
}

/// One-shot, single-assignment reply slot.
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Empty),
            cond: Condvar::new(),
        })
    }

    /// First assignment wins; later assignments are ignored.
    fn set(&self, result: Result<T>) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, SlotState::Empty) {
            *state = SlotState::Ready(result);
            self.cond.notify_all();
        }
    }

    fn is_fulfilled(&self) -> bool {
        matches!(*self.state.lock().unwrap(), SlotState::Ready(_))
    }

    /// Block until the slot is fulfilled, then consume it.
    fn take(&self) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                SlotState::Ready(_) => match std::mem::replace(&mut *state, SlotState::Consumed) {
                    SlotState::Ready(result) => return result,
                    _ => unreachable!(),
                },
                SlotState::Consumed => panic!("reply slot consumed twice"),
                SlotState::Empty => state = self.cond.wait(state).unwrap(),
            }
        }
    }
}

/// The per-peer reply map of one call: one slot per contacted peer, in
/// ascending peer-id order.
pub struct ReplyMap<T> {
    slots: BTreeMap<NodeId, Arc<Slot<T>>>,
}

impl<T> ReplyMap<T> {
    /// True if the call was sent to `node`, whether or not it has replied.
    pub fn contains(&self, node: NodeId) -> bool {
        self.slots.contains_key(&node)
    }

    /// True iff `node`'s slot is fulfilled and not yet consumed.
    pub fn valid(&self, node: NodeId) -> bool {
        self.slots
            .get(&node)
            .map(|slot| slot.is_fulfilled())
            .unwrap_or(false)
    }

    /// Consume `node`'s reply: the value, or the stored per-peer error.
    /// Blocks until the slot is fulfilled.
    pub fn get(&self, node: NodeId) -> Result<T> {
        match self.slots.get(&node) {
            Some(slot) => slot.take(),
            None => Err(Error::UnknownPeer(node)),
        }
    }

    /// Contacted peers in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.keys().copied()
    }

    /// Number of contacted peers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the call was sent to no peer.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One-shot carrier of the reply map itself.
struct MapSlot<T> {
    state: Mutex<Option<ReplyMap<T>>>,
    cond: Condvar,
}

impl<T> MapSlot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn set(&self, map: ReplyMap<T>) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.is_none(), "reply map fulfilled twice");
        if state.is_none() {
            *state = Some(map);
            self.cond.notify_all();
        }
    }

    fn wait_take(&self, timeout: Duration) -> Option<ReplyMap<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.is_some() {
                return state.take();
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

/// Read side of a call: one future per contacted peer. Movable, not
/// copyable; the underlying slots live until drained.
pub struct QueryResults<T> {
    map_slot: Arc<MapSlot<T>>,
    replies: Option<ReplyMap<T>>,
}

impl<T> QueryResults<T> {
    /// Wait up to `timeout` for the reply map; `None` on timeout. Once the
    /// map is available, subsequent calls return immediately.
    pub fn wait(&mut self, timeout: Duration) -> Option<&mut ReplyMap<T>> {
        if self.replies.is_none() {
            self.replies = Some(self.map_slot.wait_take(timeout)?);
        }
        self.replies.as_mut()
    }

    /// Block until the reply map is available, polling in five-minute
    /// quanta.
    pub fn get(&mut self) -> &mut ReplyMap<T> {
        while self.replies.is_none() {
            if let Some(map) = self.map_slot.wait_take(Duration::from_secs(300)) {
                self.replies = Some(map);
            }
        }
        match self.replies.as_mut() {
            Some(map) => map,
            None => unreachable!(),
        }
    }
}

struct PendingInner<T> {
    promises: BTreeMap<NodeId, Arc<Slot<T>>>,
    dest_nodes: BTreeSet<NodeId>,
    responded_nodes: BTreeSet<NodeId>,
    map_fulfilled: bool,
}

/// Write side of a call: holds one promise per contacted peer plus the
/// one-shot slot delivering the per-peer map.
pub struct PendingResults<T> {
    inner: Mutex<PendingInner<T>>,
    map_slot: Arc<MapSlot<T>>,
}

impl<T: Send + 'static> PendingResults<T> {
    /// Create the write/read pair for one outgoing call.
    pub fn new() -> (PendingResults<T>, QueryResults<T>) {
        let map_slot = MapSlot::new();
        (
            PendingResults {
                inner: Mutex::new(PendingInner {
                    promises: BTreeMap::new(),
                    dest_nodes: BTreeSet::new(),
                    responded_nodes: BTreeSet::new(),
                    map_fulfilled: false,
                }),
                map_slot: map_slot.clone(),
            },
            QueryResults {
                map_slot,
                replies: None,
            },
        )
    }

    /// Install one slot per contacted peer and publish the reply map.
    /// Called exactly once, after the wire send, with the peers actually
    /// contacted.
    pub fn fulfill_map(&self, who: &[NodeId]) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.map_fulfilled, "fulfill_map called twice");
        let mut slots = BTreeMap::new();
        for &node in who {
            let slot = inner.promises.entry(node).or_insert_with(Slot::new).clone();
            slots.insert(node, slot);
        }
        inner.dest_nodes.extend(who.iter().copied());
        inner.map_fulfilled = true;
        self.map_slot.set(ReplyMap { slots });
    }

    /// Record `node`'s reply value.
    pub fn set_value(&self, node: NodeId, value: T) {
        self.settle(node, Ok(value));
    }

    /// Record a per-peer error for `node`.
    pub fn set_exception(&self, node: NodeId, error: Error) {
        self.settle(node, Err(error));
    }

    fn settle(&self, node: NodeId, result: Result<T>) {
        let mut inner = self.inner.lock().unwrap();
        inner.responded_nodes.insert(node);
        let slot = inner.promises.entry(node).or_insert_with(Slot::new).clone();
        drop(inner);
        slot.set(result);
    }

    /// Whether every destination has either responded or been removed.
    pub fn is_settled(&self) -> bool {
        self.settled_inner()
    }

    fn settled_inner(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.map_fulfilled && inner.dest_nodes.is_subset(&inner.responded_nodes)
    }
}

/// Type-erased view of a pending call, held by the RPC engine.
pub trait PendingBase: Send + Sync {
    /// Install a `NodeRemoved` error for `node` if the call was sent to it
    /// and it has not responded; no-op otherwise (in particular, before
    /// `fulfill_map`).
    fn set_exception_for_removed_node(&self, node: NodeId);

    /// Whether every destination has responded or been removed.
    fn is_settled(&self) -> bool;
}

impl<T: Send + 'static> PendingBase for PendingResults<T> {
    fn set_exception_for_removed_node(&self, node: NodeId) {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.map_fulfilled
                || !inner.dest_nodes.contains(&node)
                || inner.responded_nodes.contains(&node)
            {
                return;
            }
        }
        self.settle(node, Err(Error::NodeRemoved(node)));
    }

    fn is_settled(&self) -> bool {
        self.settled_inner()
    }
}

/// Degenerate pending side for calls whose replies carry no value.
/// Reserved for a future flush primitive.
pub struct PendingVoid;

/// Degenerate query side for calls whose replies carry no value.
/// Reserved for a future flush primitive.
pub struct QueryVoid;

impl PendingVoid {
    /// Create the degenerate write/read pair.
    pub fn new() -> (PendingVoid, QueryVoid) {
        (PendingVoid, QueryVoid)
    }

    /// No-op.
    pub fn fulfill_map(&self, _who: &[NodeId]) {}
}

impl PendingBase for PendingVoid {
    fn set_exception_for_removed_node(&self, _node: NodeId) {}

    fn is_settled(&self) -> bool {
        true
    }
}

/// Registry of outstanding calls, owned by the RPC engine.
///
/// Membership losses are broadcast over every entry; entries whose
/// destinations have all responded or been removed are discarded.
pub struct PendingRegistry {
    entries: Mutex<Slab<Arc<dyn PendingBase>>>,
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Slab::new()),
        }
    }

    /// Track an outstanding call; the returned id identifies it until it is
    /// removed or reaped.
    pub fn insert(&self, pending: Arc<dyn PendingBase>) -> u64 {
        self.entries.lock().unwrap().insert(pending) as u64
    }

    /// Stop tracking a call.
    pub fn remove(&self, id: u64) -> Option<Arc<dyn PendingBase>> {
        self.entries.lock().unwrap().try_remove(id as usize)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Propagate a membership loss to every outstanding call, then discard
    /// the calls that became fully settled.
    pub fn notify_removed(&self, node: NodeId) {
        let mut entries = self.entries.lock().unwrap();
        for (_, pending) in entries.iter() {
            pending.set_exception_for_removed_node(node);
        }
        entries.retain(|_, pending| !pending.is_settled());
    }

    /// Discard fully settled calls; returns how many were dropped.
    pub fn reap(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, pending| !pending.is_settled());
        before - entries.len()
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
