//! The old-generation backend contract.
//!
//! The collector core treats the major heap as a pluggable capability
//! record: a trait object plus a flags struct. The core relies on exactly
//! two cross-cutting guarantees from every backend: copy/mark operations
//! are idempotent on already-forwarded objects, and forwarding pointers are
//! installed with release ordering atomically with the copy (both provided
//! by `util::object_header`).

use crate::util::{Address, ObjectReference};
use crate::vm::Runtime;

#[derive(Copy, Clone, Debug)]
pub struct MajorCapabilities {
    /// Marking workers may call `mark_object`/`allocate` concurrently.
    pub parallel: bool,
    /// The backend can enumerate objects per address range, as the card
    /// table scan requires.
    pub cardtable: bool,
    /// `alloc_pinned` may allocate here directly; otherwise pinned
    /// allocation routes to the large-object store.
    pub pinned_alloc_in_place: bool,
    /// The whole heap was reserved up front and never grows.
    pub fixed_heap: bool,
}

pub struct SweepStats {
    pub swept_bytes: usize,
    pub live_bytes: usize,
}

pub trait MajorHeap: Sync + Send {
    fn capabilities(&self) -> MajorCapabilities;

    /// Allocate a zeroed object slot of `size` bytes. None means the heap
    /// is exhausted (the driver then runs the OOM protocol).
    fn allocate(&self, size: usize) -> Option<Address>;

    /// Whether `addr` points into memory this backend handed out.
    fn contains(&self, addr: Address) -> bool;

    /// Resolve a candidate interior pointer to the live object containing
    /// it, if any.
    fn find_object_start(&self, rt: &dyn Runtime, addr: Address) -> Option<ObjectReference>;

    /// Visit every live object.
    fn iterate_objects(&self, rt: &dyn Runtime, f: &mut dyn FnMut(ObjectReference));

    /// Visit every live object whose extent intersects `[start, end)`.
    fn enumerate_objects_in(
        &self,
        rt: &dyn Runtime,
        start: Address,
        end: Address,
        f: &mut dyn FnMut(ObjectReference),
    );

    /// Copy-or-mark during a major pass. Returns the object's current
    /// location and whether this call shaded it (in which case the caller
    /// must enqueue the returned reference for scanning).
    fn mark_object(&self, rt: &dyn Runtime, object: ObjectReference) -> (ObjectReference, bool);

    /// Header tags a freshly promoted nursery copy starts with. A sweeping
    /// backend wants promotions made during a major pass pre-marked, or the
    /// sweep would free them.
    fn promotion_tags(&self) -> usize {
        0
    }

    fn begin_major_collection(&self);

    /// Reclaim everything unmarked, clear the surviving marks.
    fn sweep(&self, rt: &dyn Runtime) -> SweepStats;

    fn finish_major_collection(&self, rt: &dyn Runtime);

    fn free_space(&self) -> usize;

    fn used_space(&self) -> usize;

    /// (free, used) section counts.
    fn section_counts(&self) -> (usize, usize);

    /// The reserved contiguous range, for card-table sizing.
    fn reserved_range(&self) -> (Address, Address);
}
