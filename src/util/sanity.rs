//! The heap consistency checker and the diagnostic dumps.
//!
//! Everything here runs on the collection owner thread during
//! stop-the-world (or with the GC lock held), driven by the `GENGC_DEBUG`
//! flags or the `sanity` Cargo feature. A violated invariant aborts: it is
//! a collector or runtime-callback bug, never a recoverable condition.

use std::io::Write;

use crate::gengc::GenGc;
use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use crate::util::object_header;
use crate::util::{Address, ObjectReference};
use crate::vm::{walk_slots, DescriptorKind};

/// Check one object's header and every reference slot: a slot must read
/// null, or a resolvable object start in some managed section, and never a
/// forwarded object.
fn check_object(gc: &GenGc, object: ObjectReference, nursery_resolvable: bool, phase: &str) {
    object_header::assert_header_sane(object);
    let rt = gc.rt;
    let descriptor = rt.reference_descriptor(object_header::vtable(object));
    if descriptor.kind() == DescriptorKind::Bitmap && descriptor.bitmap_bits() == 0 {
        return;
    }
    let words = object_header::object_size(rt, object) / BYTES_IN_WORD;
    walk_slots(
        descriptor,
        object.to_raw_address(),
        words,
        &mut |slot: Address| {
            let Some(target) = (unsafe { ObjectReference::load_from_slot(slot) }) else {
                return;
            };
            assert!(
                !object_header::is_forwarded(target),
                "[{}] slot {} of {} holds forwarded object {}",
                phase,
                slot,
                object,
                target
            );
            let addr = target.to_raw_address();
            if gc.nursery.contains(addr) {
                if nursery_resolvable {
                    let resolved = gc.nursery.find_object_for_ptr(rt, addr);
                    assert_eq!(
                        resolved.map(|o| o.to_raw_address()),
                        Some(addr),
                        "[{}] slot {} of {} points into the nursery but not at an object start",
                        phase,
                        slot,
                        object
                    );
                }
            } else if gc.major.contains(addr) {
                let resolved = gc.major.find_object_start(rt, addr);
                assert_eq!(
                    resolved.map(|o| o.to_raw_address()),
                    Some(addr),
                    "[{}] slot {} of {} points into a freed old-generation slot",
                    phase,
                    slot,
                    object
                );
            } else if gc.los.contains(addr) {
                assert_eq!(
                    gc.los.find_object_start(addr).map(|o| o.to_raw_address()),
                    Some(addr),
                    "[{}] slot {} of {} points inside a large object",
                    phase,
                    slot,
                    object
                );
            } else {
                // Runtime-interned pointers are tolerated; see the tracer.
                trace!("[{}] slot {} holds unmanaged pointer {}", phase, slot, target);
            }
        },
    );
}

/// Whole-heap walk checking headers and reference slots of every live
/// object. Before a minor
/// collection the nursery is object-walkable and fully checked; afterwards
/// only the old generation and the large objects are.
pub fn whole_heap_check(gc: &GenGc, phase: &str) {
    debug!("consistency check ({})", phase);
    let nursery_walkable = phase.starts_with("pre");
    if nursery_walkable {
        verify_nursery(gc);
        let mut cursor = gc.nursery.start();
        while cursor < gc.nursery.end() {
            let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
            let size = raw_align_up(object_header::object_size(gc.rt, object), ALLOC_ALIGN);
            if !object_header::is_filler(object) {
                check_object(gc, object, true, phase);
            }
            cursor = cursor + size;
        }
    }
    gc.major.iterate_objects(gc.rt, &mut |object| {
        check_object(gc, object, nursery_walkable, phase);
    });
    gc.los.iterate_objects(&mut |object| {
        check_object(gc, object, nursery_walkable, phase);
    });
}

/// A linear nursery walk must terminate exactly at the section end and
/// agree with the scan-start table about every object start.
pub fn verify_nursery(gc: &GenGc) {
    let rt = gc.rt;
    let mut cursor = gc.nursery.start();
    let mut objects = 0usize;
    let mut fillers = 0usize;
    while cursor < gc.nursery.end() {
        let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
        let size = raw_align_up(object_header::object_size(rt, object), ALLOC_ALIGN);
        assert!(
            cursor + size <= gc.nursery.end(),
            "nursery object {} (size {}) overruns the section",
            object,
            size
        );
        if object_header::is_filler(object) {
            fillers += 1;
        } else {
            objects += 1;
            let resolved = gc.nursery.find_object_for_ptr(rt, cursor + (size - 1));
            assert_eq!(
                resolved,
                Some(object),
                "scan-start lookup disagrees with the linear walk at {}",
                object
            );
        }
        cursor = cursor + size;
    }
    assert_eq!(cursor, gc.nursery.end(), "nursery walk overran the section");
    debug!("nursery verified: {} objects, {} fillers", objects, fillers);
}

/// Line-oriented nursery dump at debug level.
pub fn dump_nursery(gc: &GenGc) {
    let rt = gc.rt;
    let mut cursor = gc.nursery.start();
    info!("nursery dump [{}, {})", gc.nursery.start(), gc.nursery.end());
    while cursor < gc.nursery.end() {
        let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
        let size = raw_align_up(object_header::object_size(rt, object), ALLOC_ALIGN);
        if object_header::is_filler(object) {
            info!("  {} filler {} bytes", cursor, size);
        } else {
            info!(
                "  {} object vt={} {} bytes{}",
                cursor,
                object_header::vtable(object),
                size,
                if object_header::is_pinned(object) {
                    " pinned"
                } else {
                    ""
                }
            );
        }
        cursor = cursor + size;
    }
}

/// Append a heap summary to the `heap-dump=FILE` target.
pub fn heap_dump(gc: &GenGc, file: &str, kind: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)
        .and_then(|mut f| {
            writeln!(
                f,
                "heap-dump kind={} minor={} major={} nursery=[{},{}) used={} heap={} \
                 pinned={} promoted={} los-entries={}",
                kind,
                gc.state
                    .minor_collections
                    .load(std::sync::atomic::Ordering::Relaxed),
                gc.state
                    .major_collections
                    .load(std::sync::atomic::Ordering::Relaxed),
                gc.nursery.start(),
                gc.nursery.end(),
                gc.used_size(),
                gc.heap_size(),
                gc.state
                    .last_pinned
                    .load(std::sync::atomic::Ordering::Relaxed),
                gc.state
                    .last_promoted
                    .load(std::sync::atomic::Ordering::Relaxed),
                gc.los.entry_count(),
            )?;
            for fragment in gc.nursery.fragment_snapshot() {
                writeln!(f, "  fragment [{}, {})", fragment.start, fragment.end)?;
            }
            Ok(())
        });
    if let Err(e) = result {
        warn!("heap dump to {} failed: {}", file, e);
    }
}
