//! The literal-value scenarios: nursery 4 MiB, 4 KiB scan-start buckets.

use std::sync::atomic::Ordering;

use super::fixture::*;
use crate::gengc::{self, GenGc};
use crate::memory_manager as api;
use crate::plan::mutator::Mutator;
use crate::util::constants::*;
use crate::util::{object_header, Address, ObjectReference};
use crate::vm::{Descriptor, ThreadId};

const PARAMS: &str = "nursery-size=4m,max-heap-size=64m,soft-heap-limit=64m,workers=1";

fn setup(params: &str) -> (&'static TestRuntime, &'static GenGc, Box<Mutator>) {
    let rt = TestRuntime::leaked();
    let gc = gengc::new_for_tests(rt, params, "");
    let mutator = api::bind_mutator(gc, ThreadId(1));
    (rt, gc, mutator)
}

/// A precise root range of `slots` word slots, every slot a reference.
/// Returns the (leaked) slot array base.
fn register_all_ref_root(gc: &GenGc, slots: usize) -> Address {
    let backing: &'static mut Vec<usize> = Box::leak(Box::new(vec![0usize; slots]));
    let start = Address::from_ptr(backing.as_ptr());
    let descriptor = if slots <= crate::vm::MAX_BITMAP_SLOTS {
        Descriptor::bitmap((1 << slots) - 1)
    } else {
        let words = slots.div_ceil(BITS_IN_WORD);
        let mut block = vec![words];
        for w in 0..words {
            let bits_here = (slots - w * BITS_IN_WORD).min(BITS_IN_WORD);
            block.push(if bits_here == BITS_IN_WORD {
                !0
            } else {
                (1 << bits_here) - 1
            });
        }
        let block: &'static Vec<usize> = Box::leak(Box::new(block));
        Descriptor::complex(Address::from_ptr(block.as_ptr()))
    };
    api::register_root(gc, start, slots * BYTES_IN_WORD, Some(descriptor));
    start
}

fn root_slot(base: Address, index: usize) -> Address {
    base + index * BYTES_IN_WORD
}

fn read_root(base: Address, index: usize) -> Option<ObjectReference> {
    unsafe { ObjectReference::load_from_slot(root_slot(base, index)) }
}

#[test]
fn minor_promotion_copies_rooted_survivors() {
    let (_rt, gc, mut mutator) = setup(PARAMS);
    let class = plain_class(16);
    let roots = register_all_ref_root(gc, 1000);

    let mut kept = 0;
    for i in 0..100_000 {
        let object = api::alloc(gc, &mut mutator, 16, class).unwrap();
        if i % 100 == 0 {
            unsafe { root_slot(roots, kept).store(object.to_raw_address()) };
            kept += 1;
        }
    }
    assert_eq!(kept, 1000);

    let old_addresses: Vec<Address> = (0..1000)
        .map(|i| read_root(roots, i).unwrap().to_raw_address())
        .collect();

    api::collect(gc, &mutator, 0);

    // Exactly the 1000 rooted objects survive, each copied out of the
    // nursery. (The gray stack is asserted empty by the cycle itself.)
    assert_eq!(gc.state.last_promoted.load(Ordering::Relaxed), 1000 * 16);
    assert_eq!(gc.major.used_space(), 1000 * 16);
    for i in 0..1000 {
        let survivor = read_root(roots, i).unwrap();
        let addr = survivor.to_raw_address();
        assert_ne!(addr, old_addresses[i], "survivor {} did not move", i);
        assert!(!gc.nursery.contains(addr));
        assert!(gc.major.contains(addr));
        object_header::assert_header_sane(survivor);
    }

    // The nursery is one fragment spanning its whole extent.
    let fragments = gc.nursery.fragment_snapshot();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].start, gc.nursery.start());
    assert_eq!(fragments[0].end, gc.nursery.end());
}

#[test]
fn interior_pointers_pin_in_place() {
    let (_rt, gc, mut mutator) = setup(PARAMS);
    let class = plain_class(64);

    let mut objects = vec![];
    for _ in 0..10 {
        objects.push(api::alloc(gc, &mut mutator, 64, class).unwrap());
    }

    // A conservative root of interior pointers (offset 32 into each object).
    let interior: &'static Vec<usize> = Box::leak(Box::new(
        objects
            .iter()
            .map(|o| (o.to_raw_address() + 32usize).as_usize())
            .collect(),
    ));
    api::register_root(
        gc,
        Address::from_ptr(interior.as_ptr()),
        interior.len() * BYTES_IN_WORD,
        None,
    );

    api::collect(gc, &mutator, 0);

    assert_eq!(gc.state.last_pinned.load(Ordering::Relaxed), 10);
    for object in &objects {
        // Pinned survivors stay in the nursery at their old address, never
        // forwarded; the per-collection pin tag is gone again.
        assert!(gc.nursery.contains_object(*object));
        assert!(!object_header::is_forwarded(*object));
        assert!(!object_header::is_pinned(*object));
        object_header::assert_header_sane(*object);
    }
    // The fragment list goes around the pinned run.
    let fragments = gc.nursery.fragment_snapshot();
    assert!(!fragments.is_empty());
    let pinned_end = objects[9].to_raw_address() + 64usize;
    assert!(fragments.iter().all(|f| f.start >= pinned_end));
}

#[test]
fn old_to_young_store_through_barrier() {
    let (_rt, gc, mut mutator) = setup(PARAMS);
    let holder_class = ref_class(24, &[2]);
    let young_class = plain_class(16);
    let roots = register_all_ref_root(gc, 4);

    // Make O old by promoting it through one minor collection.
    let o = api::alloc(gc, &mut mutator, 24, holder_class).unwrap();
    unsafe { root_slot(roots, 0).store(o.to_raw_address()) };
    api::collect(gc, &mutator, 0);
    let o = read_root(roots, 0).unwrap();
    assert!(gc.major.contains(o.to_raw_address()));

    // Store young Y into O's slot through the barrier; Y has no other path.
    let y = api::alloc(gc, &mut mutator, 16, young_class).unwrap();
    api::wbarrier_set_field(gc, &mut mutator, o, slot_of(o, 2), Some(y));

    api::collect(gc, &mutator, 0);

    let y_new = read_slot(o, 2).expect("slot was nulled");
    assert_ne!(y_new, y, "Y was not promoted");
    assert!(gc.major.contains(y_new.to_raw_address()));
    object_header::assert_header_sane(y_new);
}

#[test]
fn ephemeron_keys_decide_value_liveness() {
    let (rt, gc, mut mutator) = setup(PARAMS);
    let pair_class = ephemeron_class(2);
    let leaf = plain_class(16);
    let roots = register_all_ref_root(gc, 4);

    let array = api::alloc(gc, &mut mutator, 48, pair_class).unwrap();
    let k1 = api::alloc(gc, &mut mutator, 16, leaf).unwrap();
    let v1 = api::alloc(gc, &mut mutator, 16, leaf).unwrap();
    let k2 = api::alloc(gc, &mut mutator, 16, leaf).unwrap();
    let v2 = api::alloc(gc, &mut mutator, 16, leaf).unwrap();
    // Raw pair stores: the array is young, no barrier required.
    unsafe {
        slot_of(array, 2).store(k1.to_raw_address());
        slot_of(array, 3).store(v1.to_raw_address());
        slot_of(array, 4).store(k2.to_raw_address());
        slot_of(array, 5).store(v2.to_raw_address());
    }
    api::ephemeron_array_add(gc, array);

    // Keep the array and K1 reachable; drop K2.
    unsafe {
        root_slot(roots, 0).store(array.to_raw_address());
        root_slot(roots, 1).store(k1.to_raw_address());
    }

    api::collect(gc, &mutator, 1);

    let array = read_root(roots, 0).unwrap();
    let k1 = read_root(roots, 1).unwrap();
    let (pairs, count) = crate::vm::Runtime::ephemeron_pairs(rt, array);
    assert_eq!(count, 2);
    // Pair 1: key reachable, value kept alive by the collector.
    let key1: usize = unsafe { pairs.load() };
    assert_eq!(key1, k1.to_raw_address().as_usize());
    let value1 = unsafe { ObjectReference::load_from_slot(pairs + BYTES_IN_WORD) }
        .expect("V1 was cleared");
    assert!(gc.major.contains(value1.to_raw_address()));
    object_header::assert_header_sane(value1);
    // Pair 2: key unreachable -> (tombstone, null).
    let key2: usize = unsafe { (pairs + 2 * BYTES_IN_WORD).load() };
    assert_eq!(key2, api::ephemeron_tombstone().as_usize());
    let value2: usize = unsafe { (pairs + 3 * BYTES_IN_WORD).load() };
    assert_eq!(value2, 0);
}

#[test]
fn finalizer_runs_once_and_resurrects() {
    let (rt, gc, mut mutator) = setup(PARAMS);
    let class = plain_class(16);
    let roots = register_all_ref_root(gc, 2);
    rt.resurrect_into
        .store(root_slot(roots, 0).as_usize(), Ordering::SeqCst);

    let f = api::alloc(gc, &mut mutator, 16, class).unwrap();
    api::register_finalizer(gc, f);
    // No root holds F; the first minor makes it finalize-ready.
    api::collect(gc, &mutator, 0);
    assert_eq!(api::run_finalizers(gc), 1);
    let finalized = rt.finalized.lock().unwrap().clone();
    assert_eq!(finalized.len(), 1);
    let f_new = finalized[0];
    assert!(gc.major.contains(f_new.to_raw_address()));
    // The finalizer resurrected F into the root.
    assert_eq!(read_root(roots, 0), Some(f_new));

    api::collect(gc, &mutator, 0);
    // F survives the second cycle and the finalizer does not run again.
    assert_eq!(api::run_finalizers(gc), 0);
    assert_eq!(rt.finalized.lock().unwrap().len(), 1);
    assert_eq!(read_root(roots, 0), Some(f_new));
    object_header::assert_header_sane(f_new);
}

#[test]
fn stop_the_world_retries_allocator_parked_thread() {
    let (rt, gc, mutator) = setup(PARAMS);
    let parked = ThreadId(2);
    let parked_mutator = api::bind_mutator(gc, parked);
    rt.set_stack(parked, vec![]);
    // The thread answers "inside the managed allocator" twice.
    rt.park_in_allocator(parked, 2);

    api::collect(gc, &mutator, 0);

    // Round 1 and 2 suspend, observe the allocator, restart; round 3 settles.
    assert_eq!(gc.state.last_stw_rounds.load(Ordering::Relaxed), 3);
    assert_eq!(rt.suspends(parked), 3);
    // Two in-loop restarts plus the world restart.
    assert_eq!(rt.resumes(parked), 3);
    assert!(api::last_pause_ns(gc) > 0);

    api::destroy_mutator(gc, parked_mutator);
}

#[test]
fn disabled_collector_degrades_instead_of_collecting() {
    let (_rt, gc, mut mutator) = setup("nursery-size=256k,max-heap-size=64m,workers=1");
    let class = plain_class(4096);
    api::disable(gc);
    // Overcommit the nursery; allocations must keep succeeding without a
    // collection.
    for _ in 0..((256 * 1024 / 4096) * 2) {
        assert!(api::alloc(gc, &mut mutator, 4096, class).is_some());
    }
    assert_eq!(api::collection_count(gc, 0), 0);
    assert!(gc.major.used_space() > 0);
    api::enable(gc);
    api::collect(gc, &mutator, 0);
    assert_eq!(api::collection_count(gc, 0), 1);
}

#[test]
fn card_table_barrier_promotes_old_to_young() {
    let (_rt, gc, mut mutator) = setup(
        "nursery-size=4m,max-heap-size=64m,wbarrier=cardtable,workers=1",
    );
    let holder_class = ref_class(24, &[2]);
    let young_class = plain_class(16);
    let roots = register_all_ref_root(gc, 2);

    let o = api::alloc(gc, &mut mutator, 24, holder_class).unwrap();
    unsafe { root_slot(roots, 0).store(o.to_raw_address()) };
    api::collect(gc, &mutator, 0);
    let o = read_root(roots, 0).unwrap();

    let y = api::alloc(gc, &mut mutator, 16, young_class).unwrap();
    api::wbarrier_set_field(gc, &mut mutator, o, slot_of(o, 2), Some(y));
    api::collect(gc, &mutator, 0);

    let y_new = read_slot(o, 2).expect("slot was nulled");
    assert!(gc.major.contains(y_new.to_raw_address()));
}

#[test]
fn weak_links_null_and_track() {
    let (_rt, gc, mut mutator) = setup(PARAMS);
    let class = plain_class(16);
    let roots = register_all_ref_root(gc, 2);

    let kept = api::alloc(gc, &mut mutator, 16, class).unwrap();
    let doomed = api::alloc(gc, &mut mutator, 16, class).unwrap();
    unsafe { root_slot(roots, 0).store(kept.to_raw_address()) };

    let cell_kept = Address::from_mut_ptr(Box::leak(Box::new(0usize)) as *mut usize);
    let cell_doomed = Address::from_mut_ptr(Box::leak(Box::new(0usize)) as *mut usize);
    api::weak_link_add(gc, cell_kept, kept, false);
    api::weak_link_add(gc, cell_doomed, doomed, false);

    api::collect(gc, &mutator, 0);

    // The surviving target reads at its new address; the dead one is null.
    let kept_new = api::weak_link_get(gc, cell_kept).unwrap();
    assert_eq!(Some(kept_new), read_root(roots, 0));
    assert!(api::weak_link_get(gc, cell_doomed).is_none());
}

#[test]
fn large_objects_live_in_los_and_die_at_major() {
    let (_rt, gc, mut mutator) = setup(PARAMS);
    let class = plain_class(MAX_SMALL_OBJ_SIZE + 4096);
    let roots = register_all_ref_root(gc, 2);

    let kept = api::alloc(gc, &mut mutator, MAX_SMALL_OBJ_SIZE + 4096, class).unwrap();
    let doomed = api::alloc(gc, &mut mutator, MAX_SMALL_OBJ_SIZE + 4096, class).unwrap();
    assert_eq!(gc.los.entry_count(), 2);
    assert!(gc.los.contains(kept.to_raw_address()));
    unsafe { root_slot(roots, 0).store(kept.to_raw_address()) };

    // Minor collections leave the LOS alone.
    api::collect(gc, &mutator, 0);
    assert_eq!(gc.los.entry_count(), 2);

    api::collect(gc, &mutator, 1);
    assert_eq!(gc.los.entry_count(), 1);
    assert!(gc.los.contains(kept.to_raw_address()));
    assert!(!gc.los.contains(doomed.to_raw_address()));
}

#[test]
fn parallel_minor_promotion() {
    let (_rt, gc, mut mutator) = setup(
        "nursery-size=4m,max-heap-size=64m,major=marksweep-par,workers=4",
    );
    let class = ref_class(32, &[2, 3]);
    let roots = register_all_ref_root(gc, 64);

    // A few linked chains so the workers have real closure work.
    for slot in 0..64 {
        let mut prev: Option<ObjectReference> = None;
        for _ in 0..200 {
            let object = api::alloc(gc, &mut mutator, 32, class).unwrap();
            if let Some(prev) = prev {
                unsafe { slot_of(object, 2).store(prev.to_raw_address()) };
            }
            prev = Some(object);
        }
        unsafe { root_slot(roots, slot).store(prev.unwrap().to_raw_address()) };
    }

    api::collect(gc, &mutator, 0);

    assert_eq!(
        gc.state.last_promoted.load(Ordering::Relaxed),
        64 * 200 * 32
    );
    // Every chain is intact in the old generation.
    for slot in 0..64 {
        let mut cursor = read_root(roots, slot);
        let mut length = 0;
        while let Some(object) = cursor {
            assert!(gc.major.contains(object.to_raw_address()));
            object_header::assert_header_sane(object);
            length += 1;
            cursor = read_slot(object, 2);
        }
        assert_eq!(length, 200);
    }
}

#[test]
fn copying_major_backend_evacuates() {
    let (_rt, gc, mut mutator) = setup(
        "nursery-size=4m,max-heap-size=64m,major=copying,workers=1",
    );
    let class = plain_class(64);
    let roots = register_all_ref_root(gc, 8);

    for i in 0..8 {
        let object = api::alloc(gc, &mut mutator, 64, class).unwrap();
        unsafe { root_slot(roots, i).store(object.to_raw_address()) };
    }
    // Promote into the old generation, then age it through a major cycle.
    api::collect(gc, &mutator, 0);
    let promoted: Vec<ObjectReference> = (0..8).map(|i| read_root(roots, i).unwrap()).collect();
    // Drop half of them.
    for i in 0..4 {
        unsafe { root_slot(roots, i).store(0usize) };
    }
    api::collect(gc, &mutator, 1);

    for i in 4..8 {
        let object = read_root(roots, i).unwrap();
        // The copying backend evacuated the survivors to fresh blocks.
        assert_ne!(object, promoted[i]);
        assert!(gc.major.contains(object.to_raw_address()));
        object_header::assert_header_sane(object);
    }
    assert_eq!(gc.major.used_space(), 4 * 64);
}

static TOGGLE_DECISION: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn toggle_callback(_object: ObjectReference) -> crate::ToggleRefStatus {
    match TOGGLE_DECISION.load(Ordering::SeqCst) {
        0 => crate::ToggleRefStatus::Strong,
        _ => crate::ToggleRefStatus::Drop,
    }
}

#[test]
fn togglerefs_keep_strong_entries_alive() {
    let (_rt, gc, mut mutator) = setup(PARAMS);
    let class = plain_class(16);

    let object = api::alloc(gc, &mut mutator, 16, class).unwrap();
    // Observe liveness through a non-tracking weak link.
    let cell = Address::from_mut_ptr(Box::leak(Box::new(0usize)) as *mut usize);
    api::weak_link_add(gc, cell, object, false);
    api::set_toggleref_callback(gc, toggle_callback);
    api::toggleref_add(gc, object);

    TOGGLE_DECISION.store(0, Ordering::SeqCst);
    api::collect(gc, &mutator, 0);
    // The toggleref was the only thing keeping the object alive.
    let survivor = api::weak_link_get(gc, cell).expect("strong toggleref died");
    assert!(gc.major.contains(survivor.to_raw_address()));

    // Dropping the entry leaves the (now old) object garbage; a major
    // collection reaps it and nulls the link.
    TOGGLE_DECISION.store(1, Ordering::SeqCst);
    api::collect(gc, &mutator, 1);
    assert!(api::weak_link_get(gc, cell).is_none());
}
