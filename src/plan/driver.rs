//! The collection driver: allocation slow paths and the minor/major cycle
//! sequencing.
//!
//! A single owner thread drives each collection with the GC lock held. The
//! phase order of the reachability fixpoint (`finish_gray_stack`) is rigid;
//! see the numbered steps inline.

use std::sync::atomic::Ordering;

use crate::gengc::GenGc;
use crate::plan::mutator::Mutator;
use crate::plan::pinning;
use crate::plan::tracing::{CollectionKind, Tracer};
use crate::scheduler::{execute, MarkJob};
use crate::stw;
use crate::util::constants::*;
use crate::util::conversions::align_object_size;
use crate::util::object_header;
use crate::util::options::StackMarkSelector;
use crate::util::sanity;
use crate::util::{Address, ObjectReference};
use crate::vm::ThreadId;

/// Why a collection was started, for the log line.
#[derive(Copy, Clone, Debug)]
pub enum CollectReason {
    NurseryFull,
    Allowance,
    Forced,
    OutOfMemory,
    DebugAllocs,
}

// --- allocation ------------------------------------------------------------

/// Allocate a managed object. Returns None only after the full out-of-memory
/// protocol (one forced major collection, one degraded attempt) failed.
pub fn alloc(
    gc: &GenGc,
    mutator: &mut Mutator,
    size: usize,
    vtable: Address,
) -> Option<ObjectReference> {
    debug_assert!(!vtable.is_zero());
    let size = align_object_size(size);

    if let Some(every) = gc.debug.collect_before_allocs {
        mutator.alloc_count += 1;
        if mutator.alloc_count % every == 0
            && !gc.state.collection_in_progress.load(Ordering::Relaxed)
        {
            // Oversize requests are served by the LOS, not the old
            // generation; they need no contiguous old-gen space.
            let needed = if size > MAX_SMALL_OBJ_SIZE { 0 } else { size };
            perform_collection(gc, Some(mutator.thread()), 0, CollectReason::DebugAllocs, needed);
        }
    }

    if size > MAX_SMALL_OBJ_SIZE {
        return alloc_large(gc, mutator, size, vtable);
    }

    if gc.state.degraded_mode.load(Ordering::Relaxed) {
        return alloc_degraded(gc, size, vtable);
    }

    let start = match mutator.tlab_alloc(size) {
        Some(start) => start,
        None => alloc_slow(gc, mutator, size)?,
    };
    unsafe { start.store(vtable) };
    Some(unsafe { ObjectReference::from_raw_address_unchecked(start) })
}

fn try_tlab_refill(gc: &GenGc, mutator: &mut Mutator, size: usize) -> Option<Address> {
    mutator.retire_tlab();
    let (start, limit) = gc.nursery.alloc_tlab(size)?;
    mutator.adopt_tlab(start, limit);
    mutator.tlab_alloc(size)
}

fn alloc_slow(gc: &GenGc, mutator: &mut Mutator, size: usize) -> Option<Address> {
    for attempt in 0..2 {
        if let Some(start) = try_tlab_refill(gc, mutator, size) {
            return Some(start);
        }
        if gc.state.is_disabled() {
            break;
        }
        let generation = attempt; // escalate to major on the second try
        perform_collection(
            gc,
            Some(mutator.thread()),
            generation,
            if attempt == 0 {
                CollectReason::NurseryFull
            } else {
                CollectReason::OutOfMemory
            },
            size,
        );
        if gc.state.degraded_mode.load(Ordering::Relaxed) {
            break;
        }
    }
    // Last resort: serve from the old generation.
    match gc.major.allocate(size) {
        Some(start) => Some(start),
        None => {
            gc.rt.out_of_memory(size);
            None
        }
    }
}

fn alloc_degraded(gc: &GenGc, size: usize, vtable: Address) -> Option<ObjectReference> {
    let start = gc.major.allocate(size).or_else(|| {
        gc.rt.out_of_memory(size);
        None
    })?;
    unsafe { start.store(vtable) };
    Some(unsafe { ObjectReference::from_raw_address_unchecked(start) })
}

fn alloc_large(
    gc: &GenGc,
    mutator: &mut Mutator,
    size: usize,
    vtable: Address,
) -> Option<ObjectReference> {
    if gc.used_size() + size > gc.options.max_heap_size.0 && !gc.state.is_disabled() {
        perform_collection(gc, Some(mutator.thread()), 1, CollectReason::OutOfMemory, size);
        if gc.used_size() + size > gc.options.max_heap_size.0 {
            gc.rt.out_of_memory(size);
            return None;
        }
    }
    let start = gc.los.allocate(size, &gc.bounds).or_else(|| {
        gc.rt.out_of_memory(size);
        None
    })?;
    unsafe { start.store(vtable) };
    Some(unsafe { ObjectReference::from_raw_address_unchecked(start) })
}

/// Allocate an object that will never move. Served in place by non-moving
/// backends, otherwise from the large-object store.
pub fn alloc_pinned(
    gc: &GenGc,
    mutator: &mut Mutator,
    size: usize,
    vtable: Address,
) -> Option<ObjectReference> {
    let size = align_object_size(size);
    if size <= MAX_SMALL_OBJ_SIZE && gc.major.capabilities().pinned_alloc_in_place {
        if let Some(start) = gc.major.allocate(size) {
            unsafe { start.store(vtable) };
            return Some(unsafe { ObjectReference::from_raw_address_unchecked(start) });
        }
        return alloc_degraded(gc, size, vtable);
    }
    let start = gc.los.allocate(size.max(MAX_SMALL_OBJ_SIZE + ALLOC_ALIGN), &gc.bounds)?;
    unsafe { start.store(vtable) };
    Some(unsafe { ObjectReference::from_raw_address_unchecked(start) })
}

// --- collection entry ------------------------------------------------------

/// Run a collection of the requested generation (0 = minor, 1 = major) with
/// the world stopped. `space_needed` is the allocation the caller is trying
/// to satisfy (zero for forced collections); a minor cycle that leaves less
/// old-generation space free than that escalates to a major one. No-op
/// while the collector is disabled.
pub fn perform_collection(
    gc: &GenGc,
    initiator: Option<ThreadId>,
    generation: usize,
    reason: CollectReason,
    space_needed: usize,
) {
    if gc.state.is_disabled() {
        debug!("collection request ({:?}) ignored: collector disabled", reason);
        return;
    }
    let _gc_guard = gc.gc_lock.lock().unwrap();
    gc.state.collection_in_progress.store(true, Ordering::SeqCst);
    let stopped = stw::stop_world(gc, initiator);
    gc.state
        .last_stw_rounds
        .store(stopped.rounds, Ordering::Relaxed);

    let mut bridge_objects = vec![];
    let mut do_major = generation >= 1;
    if generation == 0 && gc.debug.disable_minor {
        do_major = true;
    }
    if do_major && gc.debug.disable_major {
        do_major = false;
    }

    if !do_major {
        if !gc.debug.disable_minor {
            collect_nursery(gc, reason, &mut bridge_objects);
            if need_major_collection(gc, space_needed) && !gc.debug.disable_major {
                do_major = true;
            }
        } else if !gc.debug.disable_major {
            do_major = true;
        }
    }
    if do_major {
        collect_major(gc, reason, &mut bridge_objects);
    }

    gc.state.collection_in_progress.store(false, Ordering::SeqCst);
    let pause = stw::restart_world(gc, stopped);
    gc.state.record_pause(pause);

    // World-restart post-step: hand gathered bridge objects to the runtime's
    // cycle analysis, then wake the finalizer thread if entries became ready.
    if !bridge_objects.is_empty() {
        gc.rt.process_bridge_objects(&bridge_objects);
    }
    if gc.finalizers.lock().unwrap().has_ready() {
        gc.rt.schedule_finalization();
    }
}

/// The need-major predicate: either the caller needs more contiguous space
/// than the old generation has free, or the old generation grew past the
/// allowance since the last major collection.
pub fn need_major_collection(gc: &GenGc, space_needed: usize) -> bool {
    if space_needed > gc.major.free_space() {
        return true;
    }
    let old_used = gc.major.used_space() + gc.los.used_space();
    let baseline = gc.state.old_used_baseline.load(Ordering::Relaxed);
    let growth = old_used.saturating_sub(baseline);
    growth + gc.los.alloced_since_major()
        > gc.state.minor_collection_allowance.load(Ordering::Relaxed)
}

// --- the cycles ------------------------------------------------------------

fn prepare_walkable_nursery(gc: &GenGc) {
    unsafe {
        gc.threads.for_each(|m| m.retire_tlab());
    }
    gc.nursery.clear_remaining_fragments();
    gc.nursery.update_scan_starts(gc.rt);
}

/// Conservative gathering into the pin queue: pinned-kind roots plus the
/// stacks (and register snapshots) of threads without precise scanning.
fn gather_pin_candidates(gc: &GenGc, filter_lo: Address, filter_hi: Address) {
    gc.roots.conservative_ranges(&mut |start, end| {
        pinning::pin_from_range(&gc.pin_queue, start, end, filter_lo, filter_hi);
    });
    let precise_mode = *gc.options.stack_mark == StackMarkSelector::Precise;
    unsafe {
        gc.threads.for_each(|m| {
            if m.skip {
                return;
            }
            let thread = m.thread();
            if precise_mode && gc.rt.supports_precise_stack_scan(thread) {
                return;
            }
            gc.rt.thread_conservative_ranges(thread, &mut |start, end| {
                pinning::pin_from_range(&gc.pin_queue, start, end, filter_lo, filter_hi);
            });
        });
    }
}

/// Resolve the nursery's slice of the pin queue to object starts, pinning
/// and graying each resolved object once. Returns `(start, size)` pairs in
/// ascending order for the fragment rebuild.
fn pin_nursery_objects(
    gc: &GenGc,
    tracer: &mut Tracer,
    also_mark: bool,
) -> Vec<(Address, usize)> {
    let range = gc.pin_queue.find_section_range(gc.nursery.start(), gc.nursery.end());
    let mut pinned = vec![];
    gc.pin_queue.with_range(range, |addrs| {
        for &addr in addrs {
            let Some(object) = gc.nursery.find_object_for_ptr(gc.rt, addr) else {
                continue;
            };
            if object_header::attempt_pin(object) {
                if also_mark {
                    object_header::attempt_mark(object);
                }
                if gc.debug.print_pinning {
                    info!("pinned {} (candidate {})", object, addr);
                }
                tracer.gray.enqueue(object);
                pinned.push((
                    object.to_raw_address(),
                    object_header::object_size(gc.rt, object),
                ));
            }
        }
    });
    pinned
}

/// Run the marking jobs, in parallel when the pool is up, and drain the
/// owner's queue (pinned objects) alongside.
fn mark_phase(gc: &GenGc, tracer: &mut Tracer, jobs: Vec<MarkJob>) {
    gc.remset.begin_scan_remsets();
    if gc.parallel_marking() {
        gc.workers.start_marking(tracer.kind, jobs);
        tracer.drain(-1);
        let (promoted, work) = gc.workers.join();
        tracer.promoted_bytes += promoted;
        tracer.work_done += work;
    } else {
        for job in jobs {
            execute(job, gc, tracer);
        }
        tracer.drain(-1);
    }
}

/// Unpin the nursery survivors and rebuild the fragment list from them.
fn finish_nursery(gc: &GenGc, pinned: &[(Address, usize)]) {
    let usable = gc.nursery.rebuild_fragments(pinned, gc.debug.clear_at_gc);
    for &(start, _) in pinned {
        let object = unsafe { ObjectReference::from_raw_address_unchecked(start) };
        object_header::clear_pin(object);
        object_header::clear_mark(object);
    }
    gc.pin_queue.clear();
    if usable == 0 {
        warn!("no usable nursery fragment; entering degraded mode");
        gc.state.degraded_mode.store(true, Ordering::SeqCst);
    }
    gc.state.last_pinned.store(pinned.len(), Ordering::Relaxed);
}

fn collect_nursery(gc: &GenGc, reason: CollectReason, bridge_out: &mut Vec<ObjectReference>) {
    let started = std::time::Instant::now();
    debug!("minor collection start ({:?})", reason);

    // 1-2: reset per-collection state, snapshot and close the nursery.
    gc.pin_queue.clear();
    prepare_walkable_nursery(gc);

    if gc.debug.check_at_minor_collections || cfg!(feature = "sanity") {
        sanity::whole_heap_check(gc, "pre-minor");
    }
    if gc.debug.verify_nursery_at_minor_gc {
        sanity::verify_nursery(gc);
    }
    if gc.debug.dump_nursery_at_minor_gc {
        sanity::dump_nursery(gc);
    }

    // 3: queues and remset backend get ready.
    let mut tracer = Tracer::new(gc, CollectionKind::Minor);
    gc.remset.prepare_for_minor_collection(&gc.threads);

    // 4: deferred finalize/link registrations join the tables.
    gc.finalizers.lock().unwrap().merge_staged();
    gc.references.lock().unwrap().merge_staged();

    // 5: pinning.
    gather_pin_candidates(gc, gc.nursery.start(), gc.nursery.end());
    gc.pin_queue.sort_and_dedupe();
    let pinned = pin_nursery_objects(gc, &mut tracer, false);
    gc.pin_queue
        .set_resolved(pinned.iter().map(|&(start, _)| start).collect());

    // 6-8: remset scan, root scan, marking.
    mark_phase(
        gc,
        &mut tracer,
        vec![
            MarkJob::ScanRemsets,
            MarkJob::ScanNormalRoots,
            MarkJob::ScanWbarrierRoots,
            MarkJob::ScanThreadData,
            MarkJob::ScanFinalizers,
        ],
    );

    // 9: the reachability fixpoint.
    finish_gray_stack(gc, &mut tracer, bridge_out);

    // 10-11: rebuild the nursery, drop the pin queue, clear TLABs.
    finish_nursery(gc, &pinned);
    gc.remset.finish_minor_collection();

    gc.state
        .last_promoted
        .store(tracer.promoted_bytes, Ordering::Relaxed);
    gc.state.minor_collections.fetch_add(1, Ordering::Relaxed);

    if gc.debug.check_at_minor_collections || cfg!(feature = "sanity") {
        sanity::whole_heap_check(gc, "post-minor");
    }
    if let Some(file) = &gc.debug.heap_dump {
        sanity::heap_dump(gc, file, "minor");
    }

    info!(
        "minor collection done ({:?}): {} pinned, {}k promoted, {:?}",
        reason,
        pinned.len(),
        tracer.promoted_bytes >> 10,
        started.elapsed(),
    );
}

fn collect_major(gc: &GenGc, reason: CollectReason, bridge_out: &mut Vec<ObjectReference>) {
    let started = std::time::Instant::now();
    debug!("major collection start ({:?})", reason);

    gc.pin_queue.clear();
    prepare_walkable_nursery(gc);

    let mut tracer = Tracer::new(gc, CollectionKind::Major);
    gc.remset.prepare_for_major_collection(&gc.threads);
    gc.finalizers.lock().unwrap().merge_staged();
    gc.references.lock().unwrap().merge_staged();

    gc.major.begin_major_collection();

    // Pin over the whole tracked heap, including the LOS.
    let (heap_lo, heap_hi) = gc.bounds.range();
    gather_pin_candidates(gc, heap_lo, heap_hi);
    gc.pin_queue.sort_and_dedupe();
    let pinned_nursery = pin_nursery_objects(gc, &mut tracer, true);
    let pinned_old = pin_old_objects(gc, &mut tracer);
    // Compact the queue to the definitively pinned object starts.
    let mut all_pinned: Vec<Address> = pinned_nursery
        .iter()
        .map(|&(start, _)| start)
        .chain(pinned_old)
        .collect();
    all_pinned.sort_unstable();
    gc.pin_queue.set_resolved(all_pinned);

    mark_phase(
        gc,
        &mut tracer,
        vec![
            MarkJob::ScanNormalRoots,
            MarkJob::ScanWbarrierRoots,
            MarkJob::ScanThreadData,
            MarkJob::ScanFinalizers,
        ],
    );

    finish_gray_stack(gc, &mut tracer, bridge_out);

    // Sweep: LOS first (unpin survivors, free the rest), then the backend.
    let los_freed = gc.los.sweep();
    let stats = gc.major.sweep(gc.rt);
    gc.major.finish_major_collection(gc.rt);

    finish_nursery(gc, &pinned_nursery);
    gc.state.degraded_mode.store(false, Ordering::SeqCst);

    update_allowance(gc, stats.swept_bytes + los_freed);
    gc.state.old_used_baseline.store(
        gc.major.used_space() + gc.los.used_space(),
        Ordering::Relaxed,
    );
    gc.state
        .last_promoted
        .store(tracer.promoted_bytes, Ordering::Relaxed);
    gc.state.major_collections.fetch_add(1, Ordering::Relaxed);

    if let Some(file) = &gc.debug.heap_dump {
        sanity::heap_dump(gc, file, "major");
    }

    info!(
        "major collection done ({:?}): {}k live, {}k swept, {}k los freed, {:?}",
        reason,
        stats.live_bytes >> 10,
        stats.swept_bytes >> 10,
        los_freed >> 10,
        started.elapsed(),
    );
}

/// Resolve pin candidates that fell in the old generation or the LOS:
/// mark and pin them in place. Returns the resolved object starts.
fn pin_old_objects(gc: &GenGc, tracer: &mut Tracer) -> Vec<Address> {
    let mut resolved = vec![];
    let (major_lo, major_hi) = gc.major.reserved_range();
    let range = gc.pin_queue.find_section_range(major_lo, major_hi);
    gc.pin_queue.with_range(range, |addrs| {
        for &addr in addrs {
            if let Some(object) = gc.major.find_object_start(gc.rt, addr) {
                if object_header::is_forwarded(object) {
                    continue;
                }
                if object_header::attempt_pin(object) {
                    if object_header::attempt_mark(object) {
                        tracer.gray.enqueue(object);
                    }
                    if gc.debug.print_pinning {
                        info!("pinned old object {} (candidate {})", object, addr);
                    }
                    resolved.push(object.to_raw_address());
                }
            }
        }
    });
    // LOS entries are spread across the address space; resolve the whole
    // queue against the entry table.
    gc.pin_queue.with_range(0..gc.pin_queue.len(), |addrs| {
        for &addr in addrs {
            if let Some(object) = gc.los.find_object_start(addr) {
                if object_header::attempt_pin(object) {
                    if object_header::attempt_mark(object) {
                        tracer.gray.enqueue(object);
                    }
                    resolved.push(object.to_raw_address());
                }
            }
        }
    });
    resolved
}

fn update_allowance(gc: &GenGc, saved_bytes: usize) {
    let heap_size = gc.heap_size();
    let upper = gc
        .options
        .soft_heap_limit
        .0
        .saturating_sub(heap_size)
        .max(MIN_ALLOWANCE);
    let allowance = (saved_bytes / ALLOWANCE_SAVE_RATIO).clamp(MIN_ALLOWANCE, upper);
    gc.state
        .minor_collection_allowance
        .store(allowance, Ordering::Relaxed);
    if gc.debug.print_allowance {
        info!(
            "allowance: saved {}k -> next major after {}k old-gen growth (soft headroom {}k)",
            saved_bytes >> 10,
            allowance >> 10,
            upper >> 10,
        );
    }
}

// --- the reachability fixpoint --------------------------------------------

/// The reachability fixpoint: the ordering of these passes carries all the
/// weak-reference semantics and must not be rearranged.
fn finish_gray_stack(gc: &GenGc, tracer: &mut Tracer, bridge_out: &mut Vec<ObjectReference>) {
    let rt = gc.rt;
    let bridge_active = rt.bridge_processing_active();

    // 1. Drain what marking left behind.
    tracer.drain(-1);

    // 2. Togglerefs.
    gc.references.lock().unwrap().process_togglerefs(tracer);

    // 3. Ephemerons to a fixpoint.
    loop {
        let progressed = gc
            .references
            .lock()
            .unwrap()
            .process_ephemerons(rt, tracer);
        if !progressed {
            break;
        }
    }

    // 4. Bridge gathering: unreachable bridge-class finalization candidates
    //    are promoted now and handed over after the world restarts.
    if bridge_active {
        gc.finalizers
            .lock()
            .unwrap()
            .collect_bridge_objects(rt, tracer, bridge_out);
    }

    // 5. Non-tracking weak links die with their target, before finalization.
    gc.references.lock().unwrap().null_links(tracer, false);
    tracer.drain(-1);

    // 6. Finalizer promotion loop. With bridge processing active the runtime
    //    contract allows at most one round.
    loop {
        let newly_ready = gc.finalizers.lock().unwrap().scan_for_finalization(
            rt,
            tracer,
            bridge_active,
            bridge_out,
        );
        if newly_ready == 0 || bridge_active {
            break;
        }
    }

    // 7. Finalizers may have kept ephemeron keys alive; run the pass again.
    loop {
        let progressed = gc
            .references
            .lock()
            .unwrap()
            .process_ephemerons(rt, tracer);
        if !progressed {
            break;
        }
    }

    // 8. Clear the pairs whose keys stayed unreachable.
    gc.references
        .lock()
        .unwrap()
        .clear_unreachable_ephemerons(rt, tracer);

    // 9. Tracking weak links observe the post-finalization verdict; loop the
    //    drain to a fixpoint.
    loop {
        {
            let mut references = gc.references.lock().unwrap();
            references.null_links(tracer, true);
            references.null_weak_togglerefs(tracer);
        }
        if tracer.drain(-1) == 0 {
            break;
        }
    }

    // 10. Nothing may be left gray.
    assert!(
        tracer.is_empty(),
        "gray stack not empty at the end of the reachability fixpoint"
    );
}
