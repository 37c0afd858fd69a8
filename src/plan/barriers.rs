//! Mutator write barriers.
//!
//! Every barrier performs the store first (or is called right after it) and
//! then records the slot with the remembered set when both of these hold:
//! the slot itself is outside the nursery (nursery slots are scanned
//! wholesale by the next minor collection) and the stored value points into
//! the nursery. Barriers are idempotent: re-recording a slot only costs log
//! space.
//!
//! Bulk copies longer than `WBARRIER_COPY_LOCK_THRESHOLD` slots take the GC
//! lock around the copy plus barrier pass, closing the window in which a
//! minor collection could run between the two.

use crate::gengc::GenGc;
use crate::plan::mutator::Mutator;
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};

fn post_store(gc: &GenGc, mutator: &mut Mutator, slot: Address, value: Option<ObjectReference>) {
    if gc.nursery.contains(slot) {
        return;
    }
    let Some(value) = value else {
        return;
    };
    if !gc.nursery.contains_object(value) {
        return;
    }
    gc.remset.record_pointer(mutator, slot);
}

fn store_ref(slot: Address, value: Option<ObjectReference>) {
    let raw = value.map_or(0, |v| v.to_raw_address().as_usize());
    unsafe { slot.store(raw) };
}

/// `owner.field = value`.
pub fn wbarrier_set_field(
    gc: &GenGc,
    mutator: &mut Mutator,
    _owner: ObjectReference,
    slot: Address,
    value: Option<ObjectReference>,
) {
    store_ref(slot, value);
    post_store(gc, mutator, slot, value);
}

/// `array[i] = value`.
pub fn wbarrier_set_arrayref(
    gc: &GenGc,
    mutator: &mut Mutator,
    _array: ObjectReference,
    slot: Address,
    value: Option<ObjectReference>,
) {
    store_ref(slot, value);
    post_store(gc, mutator, slot, value);
}

/// Store to a slot the runtime cannot attribute to an object.
pub fn wbarrier_generic_store(
    gc: &GenGc,
    mutator: &mut Mutator,
    slot: Address,
    value: Option<ObjectReference>,
) {
    store_ref(slot, value);
    post_store(gc, mutator, slot, value);
}

/// The store already happened; record the slot only.
pub fn wbarrier_generic_nostore(gc: &GenGc, mutator: &mut Mutator, slot: Address) {
    let value = unsafe { ObjectReference::load_from_slot(slot) };
    post_store(gc, mutator, slot, value);
}

/// memmove `count` reference slots from `src` to `dst`, with the barrier
/// pass over the destination range.
pub fn wbarrier_arrayref_copy(
    gc: &GenGc,
    mutator: &mut Mutator,
    dst: Address,
    src: Address,
    count: usize,
) {
    let copy_and_record = |mutator: &mut Mutator| {
        unsafe {
            std::ptr::copy::<usize>(src.to_ptr(), dst.to_mut_ptr(), count);
        }
        if !gc.nursery.contains(dst) {
            gc.remset.record_range(mutator, dst, count);
        }
    };
    if count > WBARRIER_COPY_LOCK_THRESHOLD {
        let _guard = gc.gc_lock.lock().unwrap();
        copy_and_record(mutator);
    } else {
        copy_and_record(mutator);
    }
}

/// Copy `count` value-type elements of the class behind `vtable`,
/// conservatively recording every destination word.
pub fn wbarrier_value_copy(
    gc: &GenGc,
    mutator: &mut Mutator,
    dst: Address,
    src: Address,
    count: usize,
    vtable: Address,
) {
    let stride = gc.rt.array_byte_size(vtable, 1) - gc.rt.array_byte_size(vtable, 0);
    debug_assert!(stride % BYTES_IN_WORD == 0);
    let bytes = count * stride;
    let words = bytes / BYTES_IN_WORD;
    let copy_and_record = |mutator: &mut Mutator| {
        unsafe {
            std::ptr::copy::<u8>(src.to_ptr(), dst.to_mut_ptr(), bytes);
        }
        if !gc.nursery.contains(dst) {
            gc.remset.record_range(mutator, dst, words);
        }
    };
    if words > WBARRIER_COPY_LOCK_THRESHOLD {
        let _guard = gc.gc_lock.lock().unwrap();
        copy_and_record(mutator);
    } else {
        copy_and_record(mutator);
    }
}

/// Copy the payload of `src` over `dst` (same class), barrier over the
/// whole destination object.
pub fn wbarrier_object_copy(
    gc: &GenGc,
    mutator: &mut Mutator,
    dst: ObjectReference,
    src: ObjectReference,
) {
    let size = gc.rt.object_size(src);
    let header = OBJECT_HEADER_WORDS * BYTES_IN_WORD;
    debug_assert!(size >= header);
    let payload = size - header;
    let dst_payload = dst.to_raw_address() + header;
    unsafe {
        std::ptr::copy::<u8>(
            (src.to_raw_address() + header).to_ptr(),
            dst_payload.to_mut_ptr(),
            payload,
        );
    }
    if !gc.nursery.contains_object(dst) {
        gc.remset
            .record_range(mutator, dst_payload, payload / BYTES_IN_WORD);
    }
}
