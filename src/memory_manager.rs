//! The embedding API.
//!
//! Everything a hosting runtime calls lives here: initialization, mutator
//! binding, allocation, root registration, the write barriers, finalization
//! and weak references, and the control surface. Functions take the
//! collector instance explicitly; `gc_init` hands out the `'static`
//! reference.
//!
//! These functions are total towards the mutator: bad but tolerable input
//! (double deregistration, weak operations on dead targets) logs and
//! continues; only genuine collector/runtime bugs abort.

use std::sync::atomic::Ordering;

use crate::gengc::{self, GenGc};
use crate::plan::barriers;
use crate::plan::driver::{self, CollectReason};
use crate::plan::mutator::Mutator;
use crate::roots::RootKind;
use crate::util::constants::*;
use crate::util::reference_processor::ToggleRefCallback;
use crate::util::{Address, ObjectReference};
use crate::vm::{Descriptor, Runtime, ThreadId};

/// Initialize the collector. Idempotent under racing callers; every caller
/// receives the same instance.
pub fn gc_init(rt: &'static dyn Runtime) -> &'static GenGc {
    gengc::initialize(rt)
}

/// The installed collector, if `gc_init` has completed.
pub fn gc_instance() -> Option<&'static GenGc> {
    gengc::instance()
}

/// The current generation count: 0 is the nursery, 1 the old generation.
pub const fn max_generation() -> usize {
    1
}

// --- threads ---------------------------------------------------------------

/// Register the calling thread as a mutator and hand it its context.
pub fn bind_mutator(gc: &GenGc, thread: ThreadId) -> Box<Mutator> {
    let mut mutator = Box::new(Mutator::new(thread));
    gc.remset.register_thread(&mut mutator);
    gc.threads.register(&mut *mutator);
    debug!("bound mutator thread {:?}", thread);
    mutator
}

/// Unregister a dying mutator. Its recorded barrier entries survive it; its
/// TLAB tail is filled so the nursery stays walkable.
pub fn destroy_mutator(gc: &GenGc, mut mutator: Box<Mutator>) {
    let _guard = gc.gc_lock.lock().unwrap();
    mutator.retire_tlab();
    gc.remset.cleanup_thread(&mut mutator);
    gc.threads.unregister(&mut *mutator);
    debug!("destroyed mutator thread {:?}", mutator.thread());
}

// --- allocation ------------------------------------------------------------

/// Allocate `size` bytes (two header words included) with the given vtable.
/// The memory past the header is zeroed. Null only after the out-of-memory
/// protocol failed.
pub fn alloc(
    gc: &GenGc,
    mutator: &mut Mutator,
    size: usize,
    vtable: Address,
) -> Option<ObjectReference> {
    driver::alloc(gc, mutator, size, vtable)
}

/// Allocate an object the collector will never move.
pub fn alloc_pinned(
    gc: &GenGc,
    mutator: &mut Mutator,
    size: usize,
    vtable: Address,
) -> Option<ObjectReference> {
    driver::alloc_pinned(gc, mutator, size, vtable)
}

/// Allocate an array of `count` elements; the byte size comes from the
/// runtime's layout callback.
pub fn alloc_array(
    gc: &GenGc,
    mutator: &mut Mutator,
    vtable: Address,
    count: usize,
) -> Option<ObjectReference> {
    let size = gc.rt.array_byte_size(vtable, count);
    driver::alloc(gc, mutator, size, vtable)
}

// --- roots -----------------------------------------------------------------

/// Register a root range. A `None` descriptor registers a conservative
/// (pinning) root; `Some` registers a precise one.
pub fn register_root(gc: &GenGc, start: Address, size: usize, descriptor: Option<Descriptor>) {
    let _guard = gc.gc_lock.lock().unwrap();
    match descriptor {
        Some(descriptor) => gc.roots.register(start, size, descriptor, RootKind::Normal),
        None => gc
            .roots
            .register(start, size, Descriptor::EMPTY, RootKind::Pinned),
    }
}

/// Register a precise root range whose stores go through the write barrier.
pub fn register_root_wbarrier(gc: &GenGc, start: Address, size: usize, descriptor: Descriptor) {
    let _guard = gc.gc_lock.lock().unwrap();
    gc.roots.register(start, size, descriptor, RootKind::WBarrier);
}

pub fn deregister_root(gc: &GenGc, start: Address) {
    let _guard = gc.gc_lock.lock().unwrap();
    if !gc.roots.deregister(start) {
        warn!("deregistering unknown root {}", start);
    }
}

// --- write barriers --------------------------------------------------------

pub use barriers::{
    wbarrier_arrayref_copy, wbarrier_generic_nostore, wbarrier_generic_store,
    wbarrier_object_copy, wbarrier_set_arrayref, wbarrier_set_field, wbarrier_value_copy,
};

/// The constants a runtime code generator needs to emit the inline
/// allocation and barrier fast paths.
pub struct BarrierLayout {
    pub nursery_start: Address,
    pub nursery_shift: usize,
    pub store_buffer_size: usize,
    pub tlab_cursor_offset: usize,
    pub tlab_limit_offset: usize,
    pub ssb_cursor_offset: usize,
    pub ssb_offset: usize,
    /// `(table base, covered region base)` when the card-table backend is
    /// active.
    pub card_table: Option<(Address, Address)>,
}

pub fn barrier_layout(gc: &GenGc) -> BarrierLayout {
    use crate::plan::mutator::*;
    BarrierLayout {
        nursery_start: gc.nursery.start(),
        nursery_shift: gc.nursery.log_size(),
        store_buffer_size: STORE_REMSET_BUFFER_SIZE,
        tlab_cursor_offset: mutator_tlab_cursor_offset(),
        tlab_limit_offset: mutator_tlab_limit_offset(),
        ssb_cursor_offset: mutator_ssb_cursor_offset(),
        ssb_offset: mutator_ssb_offset(),
        card_table: gc.remset.card_table_info(),
    }
}

// --- finalization & weak references ----------------------------------------

pub fn register_finalizer(gc: &GenGc, object: ObjectReference) {
    let in_gc = gc.state.collection_in_progress.load(Ordering::SeqCst);
    gc.finalizers.lock().unwrap().add(object, in_gc);
}

/// Drain the finalize-ready lists, invoking each finalizer exactly once.
/// Called by the runtime's finalizer thread, outside stop-the-world.
/// Returns the number of finalizers run.
pub fn run_finalizers(gc: &GenGc) -> usize {
    let mut count = 0;
    loop {
        // Detach under the GC lock, invoke outside it.
        let entry = {
            let _guard = gc.gc_lock.lock().unwrap();
            gc.finalizers.lock().unwrap().pop_ready()
        };
        let Some(object) = entry else {
            break;
        };
        trace!("running finalizer for {}", object);
        gc.rt.invoke_finalizer(object);
        count += 1;
    }
    count
}

/// Register (or retarget) a disappearing-link cell. The slot will read the
/// target until it dies; `track` links survive resurrection decisions.
pub fn weak_link_add(gc: &GenGc, slot: Address, target: ObjectReference, track: bool) {
    let _guard = gc.gc_lock.lock().unwrap();
    let in_gc = gc.state.collection_in_progress.load(Ordering::SeqCst);
    gc.references
        .lock()
        .unwrap()
        .link_add(slot, target, track, in_gc);
}

pub fn weak_link_remove(gc: &GenGc, slot: Address) {
    let _guard = gc.gc_lock.lock().unwrap();
    gc.references.lock().unwrap().link_remove(slot);
}

pub fn weak_link_get(gc: &GenGc, slot: Address) -> Option<ObjectReference> {
    let _guard = gc.gc_lock.lock().unwrap();
    gc.references.lock().unwrap().link_get(slot)
}

/// Register an ephemeron `(key, value)` pair array.
pub fn ephemeron_array_add(gc: &GenGc, array: ObjectReference) {
    let _guard = gc.gc_lock.lock().unwrap();
    let in_gc = gc.state.collection_in_progress.load(Ordering::SeqCst);
    gc.references.lock().unwrap().ephemeron_add(array, in_gc);
}

/// The cleared-key sentinel an ephemeron pair reads after its key died.
pub fn ephemeron_tombstone() -> Address {
    crate::util::reference_processor::tombstone()
}

pub fn toggleref_add(gc: &GenGc, object: ObjectReference) {
    let _guard = gc.gc_lock.lock().unwrap();
    gc.references.lock().unwrap().toggleref_add(object);
}

pub fn set_toggleref_callback(gc: &GenGc, callback: ToggleRefCallback) {
    let _guard = gc.gc_lock.lock().unwrap();
    gc.references.lock().unwrap().set_toggleref_callback(callback);
}

// --- control ---------------------------------------------------------------

/// Force a collection of the given generation (0 minor, 1 major).
pub fn collect(gc: &GenGc, mutator: &Mutator, generation: usize) {
    driver::perform_collection(
        gc,
        Some(mutator.thread()),
        generation.min(max_generation()),
        CollectReason::Forced,
        0,
    );
}

pub fn collection_count(gc: &GenGc, generation: usize) -> usize {
    gc.collection_count(generation)
}

pub fn used_size(gc: &GenGc) -> usize {
    gc.used_size()
}

pub fn heap_size(gc: &GenGc) -> usize {
    gc.heap_size()
}

/// Suspend collections. Nests; allocation falls back to the degraded path
/// when the nursery runs dry while disabled.
pub fn disable(gc: &GenGc) {
    gc.state.disabled.fetch_add(1, Ordering::SeqCst);
}

pub fn enable(gc: &GenGc) {
    let was = gc.state.disabled.fetch_sub(1, Ordering::SeqCst);
    assert!(was > 0, "gc enable without matching disable");
}

/// Pause of the last collection, in nanoseconds.
pub fn last_pause_ns(gc: &GenGc) -> u64 {
    gc.state.last_pause_ns.load(Ordering::Relaxed)
}

pub fn total_pause_ns(gc: &GenGc) -> u64 {
    gc.state.total_pause_ns.load(Ordering::Relaxed)
}

pub fn in_degraded_mode(gc: &GenGc) -> bool {
    gc.state.degraded_mode.load(Ordering::Relaxed)
}
