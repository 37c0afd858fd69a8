//! Process-wide collector counters and flags. Everything here is a plain
//! atomic: written by the collection owner, read from the control API at any
//! time.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::util::constants::MIN_ALLOWANCE;

pub struct GlobalState {
    pub minor_collections: AtomicUsize,
    pub major_collections: AtomicUsize,
    /// Nursery cannot serve allocations; mutators fall through to the major
    /// backend until the next major collection.
    pub degraded_mode: AtomicBool,
    /// Nesting depth of `gc_disable`.
    pub disabled: AtomicUsize,
    /// A collection cycle is running (registration staging trigger).
    pub collection_in_progress: AtomicBool,
    /// Bytes the old generation may grow since the last major collection
    /// before the next minor escalates to a major.
    pub minor_collection_allowance: AtomicUsize,
    /// `major.used_space() + los.used_space()` right after the last major.
    pub old_used_baseline: AtomicUsize,
    pub last_pause_ns: AtomicU64,
    pub total_pause_ns: AtomicU64,
    /// Handshake rounds of the last stop-the-world.
    pub last_stw_rounds: AtomicUsize,
    /// Pinned objects in the last collection.
    pub last_pinned: AtomicUsize,
    /// Bytes promoted out of the nursery in the last collection.
    pub last_promoted: AtomicUsize,
}

impl GlobalState {
    pub fn new() -> Self {
        GlobalState {
            minor_collections: AtomicUsize::new(0),
            major_collections: AtomicUsize::new(0),
            degraded_mode: AtomicBool::new(false),
            disabled: AtomicUsize::new(0),
            collection_in_progress: AtomicBool::new(false),
            minor_collection_allowance: AtomicUsize::new(MIN_ALLOWANCE),
            old_used_baseline: AtomicUsize::new(0),
            last_pause_ns: AtomicU64::new(0),
            total_pause_ns: AtomicU64::new(0),
            last_stw_rounds: AtomicUsize::new(0),
            last_pinned: AtomicUsize::new(0),
            last_promoted: AtomicUsize::new(0),
        }
    }

    pub fn record_pause(&self, pause: std::time::Duration) {
        let ns = pause.as_nanos() as u64;
        self.last_pause_ns.store(ns, Ordering::Relaxed);
        self.total_pause_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst) > 0
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}
