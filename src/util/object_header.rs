//! Object header algebra.
//!
//! Every managed object starts with two machine words. Word 0 is the vtable
//! pointer supplied by the runtime at allocation. Word 1 is the forwarding
//! word: it carries the tag bits below and, once an object has been moved,
//! the forwarding address. `ALLOC_ALIGN` is 8, so a forwarding address never
//! collides with the tags.
//!
//! `PINNED` and `FORWARDED` are mutually exclusive; observing both set is a
//! fatal collector bug. An in-progress copy is encoded as `FORWARDED` with
//! zero address bits, and readers spin until the copier publishes the real
//! address with a release store.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::{Address, ObjectReference};
use crate::vm::Runtime;

pub const TAG_PINNED: usize = 1 << 0;
pub const TAG_FORWARDED: usize = 1 << 1;
pub const TAG_MARKED: usize = 1 << 2;
pub const TAG_MASK: usize = 0b111;
pub const FORWARDING_ADDR_MASK: usize = !TAG_MASK;

const_assert!(TAG_MASK < ALLOC_ALIGN);

/// Offset of the forwarding word from the object start.
pub const FORWARDING_WORD_OFFSET: usize = BYTES_IN_WORD;

// Sentinel vtables for dead-area fillers. A multi-word filler records its
// byte length in the forwarding word; the one-word filler is always exactly
// one word long (a gap too small to hold a two-word header).
static FILLER_VTABLE_SENTINEL: usize = 0;
static FILLER_WORD_SENTINEL: usize = 0;

pub fn filler_vtable() -> Address {
    Address::from_ref(&FILLER_VTABLE_SENTINEL)
}

pub fn filler_word_vtable() -> Address {
    Address::from_ref(&FILLER_WORD_SENTINEL)
}

pub fn vtable(object: ObjectReference) -> Address {
    unsafe { object.to_raw_address().load() }
}

pub fn set_vtable(object: ObjectReference, vtable: Address) {
    unsafe { object.to_raw_address().store(vtable) }
}

fn forwarding_atomic(object: ObjectReference) -> &'static AtomicUsize {
    unsafe { (object.to_raw_address() + FORWARDING_WORD_OFFSET).as_atomic_word() }
}

pub fn forwarding_word(object: ObjectReference) -> usize {
    forwarding_atomic(object).load(Ordering::Acquire)
}

pub fn is_filler(object: ObjectReference) -> bool {
    let vt = vtable(object);
    vt == filler_vtable() || vt == filler_word_vtable()
}

/// Fill a dead range with a sentinel object so linear scans keep stepping
/// object-by-object. `size` must be a multiple of the word size.
pub fn write_filler(start: Address, size: usize) {
    debug_assert!(size >= BYTES_IN_WORD && size % BYTES_IN_WORD == 0);
    if size == BYTES_IN_WORD {
        unsafe { start.store(filler_word_vtable()) };
    } else {
        unsafe {
            start.store(filler_vtable());
            (start + FORWARDING_WORD_OFFSET).store(size);
        }
    }
}

/// Size of any object, filler or runtime-managed.
pub fn object_size(rt: &dyn Runtime, object: ObjectReference) -> usize {
    let vt = vtable(object);
    let size = if vt == filler_word_vtable() {
        BYTES_IN_WORD
    } else if vt == filler_vtable() {
        unsafe { (object.to_raw_address() + FORWARDING_WORD_OFFSET).load() }
    } else {
        rt.object_size(object)
    };
    debug_assert!(size >= BYTES_IN_WORD);
    size
}

pub fn is_pinned(object: ObjectReference) -> bool {
    forwarding_word(object) & TAG_PINNED != 0
}

/// Set the pin tag. Returns true if this call pinned the object (it was not
/// pinned before), which doubles as the enqueue-once test during pinning.
pub fn attempt_pin(object: ObjectReference) -> bool {
    let old = forwarding_atomic(object).fetch_or(TAG_PINNED, Ordering::SeqCst);
    assert!(
        old & TAG_FORWARDED == 0,
        "pinning a forwarded object {} (header {:#x})",
        object,
        old
    );
    old & TAG_PINNED == 0
}

pub fn clear_pin(object: ObjectReference) {
    forwarding_atomic(object).fetch_and(!TAG_PINNED, Ordering::SeqCst);
}

pub fn is_marked(object: ObjectReference) -> bool {
    forwarding_word(object) & TAG_MARKED != 0
}

/// Test-and-set the mark tag. Returns true if this call marked the object.
pub fn attempt_mark(object: ObjectReference) -> bool {
    let old = forwarding_atomic(object).fetch_or(TAG_MARKED, Ordering::SeqCst);
    old & TAG_MARKED == 0
}

pub fn clear_mark(object: ObjectReference) {
    forwarding_atomic(object).fetch_and(!TAG_MARKED, Ordering::SeqCst);
}

pub fn is_forwarded(object: ObjectReference) -> bool {
    forwarding_word(object) & TAG_FORWARDED != 0
}

/// The outcome of trying to become the copier of an object.
pub enum ForwardingClaim {
    /// The caller owns the copy. It must finish with `install_forwarding`.
    /// The payload is the pre-claim forwarding word (tag bits to carry over).
    Claimed(usize),
    /// Somebody else copied the object; here is where it went.
    Forwarded(ObjectReference),
}

/// Attempt to become the thread that forwards `object`. Losing racers spin
/// until the winner publishes the forwarding address.
pub fn attempt_to_forward(object: ObjectReference) -> ForwardingClaim {
    let atomic = forwarding_atomic(object);
    loop {
        let old = atomic.load(Ordering::Acquire);
        if old & TAG_FORWARDED != 0 {
            return ForwardingClaim::Forwarded(spin_and_get_forwarded(object));
        }
        assert!(
            old & TAG_PINNED == 0,
            "forwarding a pinned object {} (header {:#x})",
            object,
            old
        );
        // Claim with the in-progress encoding: FORWARDED tag, zero address.
        if atomic
            .compare_exchange_weak(old, TAG_FORWARDED, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
        {
            return ForwardingClaim::Claimed(old);
        }
    }
}

/// Publish the forwarding address. Release so a reader observing the
/// FORWARDED tag also observes the address and the copied payload.
pub fn install_forwarding(object: ObjectReference, to: ObjectReference) {
    let addr = to.to_raw_address().as_usize();
    debug_assert!(addr & TAG_MASK == 0);
    forwarding_atomic(object).store(addr | TAG_FORWARDED, Ordering::Release);
}

/// Wait out an in-progress copy and read the forwarding address.
pub fn spin_and_get_forwarded(object: ObjectReference) -> ObjectReference {
    loop {
        let word = forwarding_word(object);
        debug_assert!(word & TAG_FORWARDED != 0);
        let addr = word & FORWARDING_ADDR_MASK;
        if addr != 0 {
            return unsafe {
                ObjectReference::from_raw_address_unchecked(Address::from_usize(addr))
            };
        }
        std::hint::spin_loop();
    }
}

/// Non-blocking read of the forwarding address, if fully installed.
pub fn forwarding_address(object: ObjectReference) -> Option<ObjectReference> {
    let word = forwarding_word(object);
    if word & TAG_FORWARDED != 0 && word & FORWARDING_ADDR_MASK != 0 {
        Some(unsafe {
            ObjectReference::from_raw_address_unchecked(Address::from_usize(
                word & FORWARDING_ADDR_MASK,
            ))
        })
    } else {
        None
    }
}

/// Reset the forwarding word of a fresh copy, preserving nothing but the
/// tags the caller wants to carry over.
pub fn reset_forwarding_word(object: ObjectReference, carried_tags: usize) {
    debug_assert!(carried_tags & !TAG_MASK == 0);
    forwarding_atomic(object).store(carried_tags, Ordering::Relaxed);
}

/// Fatal header check used by the consistency passes.
pub fn assert_header_sane(object: ObjectReference) {
    let vt = vtable(object);
    assert!(
        !vt.is_zero() && vt.is_aligned_to(BYTES_IN_WORD),
        "misaligned or null vtable word {} for object {}",
        vt,
        object
    );
    let word = forwarding_word(object);
    assert!(
        word & (TAG_PINNED | TAG_FORWARDED) != (TAG_PINNED | TAG_FORWARDED),
        "object {} is both pinned and forwarded (header {:#x})",
        object,
        word
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory;

    fn fake_object() -> ObjectReference {
        let a = memory::dzmmap(crate::util::constants::BYTES_IN_PAGE).unwrap();
        unsafe { a.store(Address::from_usize(0x1000)) };
        unsafe { ObjectReference::from_raw_address_unchecked(a) }
    }

    #[test]
    fn pin_is_sticky_and_reported_once() {
        let o = fake_object();
        assert!(!is_pinned(o));
        assert!(attempt_pin(o));
        assert!(!attempt_pin(o));
        assert!(is_pinned(o));
        clear_pin(o);
        assert!(!is_pinned(o));
    }

    #[test]
    fn mark_test_and_set() {
        let o = fake_object();
        assert!(attempt_mark(o));
        assert!(!attempt_mark(o));
        clear_mark(o);
        assert!(attempt_mark(o));
    }

    #[test]
    fn forwarding_roundtrip() {
        let o = fake_object();
        let target = fake_object();
        match attempt_to_forward(o) {
            ForwardingClaim::Claimed(old) => {
                assert_eq!(old, 0);
                install_forwarding(o, target);
            }
            ForwardingClaim::Forwarded(_) => panic!("fresh object cannot be forwarded"),
        }
        assert!(is_forwarded(o));
        assert_eq!(forwarding_address(o), Some(target));
        match attempt_to_forward(o) {
            ForwardingClaim::Forwarded(t) => assert_eq!(t, target),
            _ => panic!("second claim must observe the forwarding"),
        }
    }

    #[test]
    fn filler_sizes() {
        let a = memory::dzmmap(crate::util::constants::BYTES_IN_PAGE).unwrap();
        write_filler(a, 64);
        let o = unsafe { ObjectReference::from_raw_address_unchecked(a) };
        assert!(is_filler(o));
        write_filler(a + 64usize, BYTES_IN_WORD);
        let w = unsafe { ObjectReference::from_raw_address_unchecked(a + 64usize) };
        assert!(is_filler(w));
    }
}
