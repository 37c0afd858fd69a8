//! The tracing engine: copying/marking transitive closure over the gray
//! queue.
//!
//! A `Tracer` owns one private gray queue. The collection owner uses a
//! single tracer; in parallel mode every marking worker owns one, wired to
//! the shared distribute queue for rebalancing. All shading operations are
//! test-and-set (forwarding claim, mark tag, pin tag), so an object is
//! enqueued at most once per collection no matter how many tracers race.

use crate::gengc::GenGc;
use crate::util::constants::*;
use crate::util::gray::{GrayQueue, SectionDistributeQueue};
use crate::util::object_header::{self, ForwardingClaim};
use crate::util::{Address, ObjectReference};
use crate::vm::{walk_slots, DescriptorKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CollectionKind {
    Minor,
    Major,
}

/// Private sections beyond this spill to the distribute queue.
const SPARE_SECTION_THRESHOLD: usize = 1;

pub struct Tracer<'a> {
    pub gc: &'a GenGc,
    pub kind: CollectionKind,
    pub gray: GrayQueue,
    distribute: Option<&'a SectionDistributeQueue>,
    /// Bytes copied out of the nursery by this tracer.
    pub promoted_bytes: usize,
    /// Objects shaded (copied or newly marked); the ephemeron rounds use
    /// this to detect a fixpoint.
    pub work_done: usize,
}

impl<'a> Tracer<'a> {
    pub fn new(gc: &'a GenGc, kind: CollectionKind) -> Tracer<'a> {
        Tracer {
            gc,
            kind,
            gray: GrayQueue::new(),
            distribute: None,
            promoted_bytes: 0,
            work_done: 0,
        }
    }

    pub fn with_distribute(
        gc: &'a GenGc,
        kind: CollectionKind,
        distribute: &'a SectionDistributeQueue,
    ) -> Tracer<'a> {
        Tracer {
            gc,
            kind,
            gray: GrayQueue::new(),
            distribute: Some(distribute),
            promoted_bytes: 0,
            work_done: 0,
        }
    }

    /// Trace through one reference slot: copy/mark the target and rewrite
    /// the slot if the target moved.
    pub fn trace_slot(&mut self, slot: Address) {
        let Some(object) = (unsafe { ObjectReference::load_from_slot(slot) }) else {
            return;
        };
        let target = self.trace_object(object);
        if target != object {
            unsafe { slot.store(target.to_raw_address()) };
        }
        self.record_old_to_young(slot, target);
    }

    /// Record an old-generation slot left pointing at a (pinned) nursery
    /// survivor, so the next minor collection finds it again.
    pub fn record_old_to_young(&self, slot: Address, target: ObjectReference) {
        if self.gc.nursery.contains_object(target) && self.slot_is_in_old_heap(slot) {
            self.gc.remset.record_global(slot);
        }
    }

    fn slot_is_in_old_heap(&self, slot: Address) -> bool {
        !self.gc.nursery.contains(slot)
            && (self.gc.major.contains(slot) || self.gc.los.contains(slot))
    }

    /// Copy or mark one object, returning its (possibly new) location.
    pub fn trace_object(&mut self, object: ObjectReference) -> ObjectReference {
        match self.kind {
            CollectionKind::Minor => self.trace_object_minor(object),
            CollectionKind::Major => self.trace_object_major(object),
        }
    }

    fn trace_object_minor(&mut self, object: ObjectReference) -> ObjectReference {
        if !self.gc.nursery.contains_object(object) {
            // Old objects are not traced through in a minor collection; the
            // remembered set stands in for them.
            return object;
        }
        debug_assert!(!object_header::is_filler(object));
        if object_header::is_pinned(object) {
            // Enqueued once by the pinning phase.
            return object;
        }
        self.promote(object)
    }

    fn trace_object_major(&mut self, object: ObjectReference) -> ObjectReference {
        let addr = object.to_raw_address();
        if self.gc.nursery.contains(addr) {
            debug_assert!(!object_header::is_filler(object));
            if object_header::is_pinned(object) {
                if object_header::attempt_mark(object) {
                    self.work_done += 1;
                    self.gray_enqueue(object);
                }
                return object;
            }
            return self.promote(object);
        }
        if self.gc.los.contains(addr) {
            if object_header::attempt_mark(object) {
                self.work_done += 1;
                self.gray_enqueue(object);
            }
            return object;
        }
        if self.gc.major.contains(addr) {
            let (target, shaded) = self.gc.major.mark_object(self.gc.rt, object);
            if shaded {
                self.work_done += 1;
                self.gray_enqueue(target);
            }
            return target;
        }
        // A reference slot holding a pointer the collector does not manage
        // (runtime-interned data). Leave it alone.
        if cfg!(feature = "extreme_assertions") {
            panic!("traced reference {} outside every managed section", object);
        }
        object
    }

    /// Copy a nursery object into the old generation, claiming the
    /// forwarding word. Idempotent: racers converge on one copy.
    fn promote(&mut self, object: ObjectReference) -> ObjectReference {
        match object_header::attempt_to_forward(object) {
            ForwardingClaim::Forwarded(to) => to,
            ForwardingClaim::Claimed(_) => {
                let size = object_header::object_size(self.gc.rt, object);
                let to = self.gc.major.allocate(size).unwrap_or_else(|| {
                    // No recovery mid-collection: losing a survivor would
                    // corrupt the graph.
                    panic!("old generation exhausted while promoting {}", object)
                });
                unsafe {
                    std::ptr::copy_nonoverlapping::<u8>(
                        object.to_raw_address().to_ptr(),
                        to.to_mut_ptr(),
                        size,
                    );
                }
                let new_object = unsafe { ObjectReference::from_raw_address_unchecked(to) };
                object_header::reset_forwarding_word(new_object, self.gc.major.promotion_tags());
                object_header::install_forwarding(object, new_object);
                self.promoted_bytes += size;
                self.work_done += 1;
                self.gray_enqueue(new_object);
                new_object
            }
        }
    }

    /// Keep an object alive regardless of prior reachability (finalizer
    /// promotion, ephemeron values). Returns its current location.
    pub fn keep_alive(&mut self, object: ObjectReference) -> ObjectReference {
        self.trace_object(object)
    }

    /// Whether an object survived this collection so far.
    pub fn is_live(&self, object: ObjectReference) -> bool {
        match self.kind {
            CollectionKind::Minor => {
                if self.gc.nursery.contains_object(object) {
                    object_header::is_pinned(object) || object_header::is_forwarded(object)
                } else {
                    true
                }
            }
            CollectionKind::Major => {
                object_header::is_forwarded(object) || object_header::is_marked(object)
            }
        }
    }

    /// Current location of an object that may have been copied.
    pub fn resolve(&self, object: ObjectReference) -> ObjectReference {
        object_header::forwarding_address(object).unwrap_or(object)
    }

    fn gray_enqueue(&mut self, object: ObjectReference) {
        self.gray.enqueue(object);
        if let Some(distribute) = self.distribute {
            while self.gray.spare_sections() > SPARE_SECTION_THRESHOLD {
                distribute.push(self.gray.take_section().unwrap());
            }
        }
    }

    /// Scan the reference slots of one object, enqueueing what they reach.
    pub fn scan_object(&mut self, object: ObjectReference) {
        debug_assert!(!object_header::is_filler(object));
        let vtable = object_header::vtable(object);
        let descriptor = self.gc.rt.reference_descriptor(vtable);
        if descriptor.kind() == DescriptorKind::Bitmap && descriptor.bitmap_bits() == 0 {
            return;
        }
        let words = object_header::object_size(self.gc.rt, object) / BYTES_IN_WORD;
        let start = object.to_raw_address();
        // The walk relays straight back into trace_slot; split the borrow.
        let mut slots = vec![];
        walk_slots(descriptor, start, words, &mut |slot| slots.push(slot));
        for slot in slots {
            self.trace_slot(slot);
        }
    }

    /// Scan up to `max` gray objects (drain fully when `max` is negative).
    /// Returns the number scanned.
    pub fn drain(&mut self, max: isize) -> usize {
        let mut scanned = 0;
        while let Some(object) = self.gray.dequeue() {
            self.scan_object(object);
            scanned += 1;
            if max >= 0 && scanned >= max as usize {
                break;
            }
        }
        scanned
    }

    pub fn is_empty(&self) -> bool {
        self.gray.is_empty()
    }
}
