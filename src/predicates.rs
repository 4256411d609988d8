//! Predicate/observer subsystem of the shared state table.
//!
//! Predicates are boolean triggers over the table paired with actions. A
//! dedicated worker per table instance scans registered predicates in
//! registration order at a bounded polling interval and runs the action
//! synchronously when the trigger holds. Registrations made while a cycle is
//! in progress (including from inside an action) take effect no earlier than
//! the next cycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::table::SstTable;

/// Whether a predicate fires at most once or re-arms after each fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    /// Fires at most once, then is discarded.
    OneTime,
    /// Re-armed after each fire; fires once per cycle in which the trigger
    /// holds.
    Recurrent,
}

/// Handle returned by [`Predicates::register`], usable for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateHandle(u64);

type Trigger = Box<dyn Fn(&SstTable) -> bool + Send>;
type Action = Box<dyn FnMut(&SstTable) + Send>;

struct PredicateEntry {
    handle: u64,
    kind: PredicateKind,
    trigger: Trigger,
    action: Action,
}

/// Registry of predicates for one table instance.
pub struct Predicates {
    pending: Mutex<Vec<PredicateEntry>>,
    removed: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
}

impl Predicates {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            removed: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(0),
        }
    }

    /// Register a predicate. Takes effect at the start of the next scan
    /// cycle; predicates registered earlier fire first within a cycle.
    pub fn register(
        &self,
        trigger: impl Fn(&SstTable) -> bool + Send + 'static,
        action: impl FnMut(&SstTable) + Send + 'static,
        kind: PredicateKind,
    ) -> PredicateHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().unwrap().push(PredicateEntry {
            handle,
            kind,
            trigger: Box::new(trigger),
            action: Box::new(action),
        });
        PredicateHandle(handle)
    }

    /// Remove a registered predicate. Takes effect at the start of the next
    /// scan cycle.
    pub fn remove(&self, handle: PredicateHandle) {
        self.removed.lock().unwrap().insert(handle.0);
    }

    fn drain_pending(&self, into: &mut Vec<PredicateEntry>) {
        into.append(&mut self.pending.lock().unwrap());
        let removed = {
            let mut removed = self.removed.lock().unwrap();
            std::mem::take(&mut *removed)
        };
        if !removed.is_empty() {
            into.retain(|entry| !removed.contains(&entry.handle));
        }
    }
}

/// Predicate scan loop, run on the table's dedicated worker thread.
///
/// The worker owns the active list and holds only a weak reference to the
/// table; it exits when the table is gone or shutdown is requested.
pub(crate) fn scan_loop(table: Weak<SstTable>, interval: Duration) {
    tracing::debug!("predicate worker started");
    let mut active: Vec<PredicateEntry> = Vec::new();
    loop {
        thread::sleep(interval);
        let core = match table.upgrade() {
            Some(core) => core,
            None => break,
        };
        if core.shutdown_requested() {
            break;
        }

        // New registrations and removals become visible here, at cycle
        // start; an action registering a predicate therefore never sees it
        // fire within the same cycle.
        core.predicates().drain_pending(&mut active);

        let mut survivors = Vec::with_capacity(active.len());
        for mut entry in active.drain(..) {
            let mut fired = false;
            if (entry.trigger)(&core) {
                (entry.action)(&core);
                fired = true;
            }
            if fired && entry.kind == PredicateKind::OneTime {
                continue;
            }
            survivors.push(entry);
        }
        active = survivors;
    }
    tracing::debug!("predicate worker exiting");
}
