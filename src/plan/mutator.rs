//! Per-thread mutator context: the TLAB and the sequential store buffer.
//!
//! The layout is `repr(C)` and the hot field offsets are published as
//! constants so a runtime's code generator can emit the inline allocation
//! and write-barrier fast paths against the raw mutator pointer.

use std::sync::Mutex;

use crate::util::constants::*;
use crate::util::object_header;
use crate::util::Address;
use crate::vm::ThreadId;

#[repr(C)]
pub struct Mutator {
    /// Bump pointer into the current TLAB. Zero when no TLAB is held.
    pub(crate) tlab_cursor: Address,
    /// End of the current TLAB.
    pub(crate) tlab_limit: Address,
    /// Next free index in the store buffer.
    pub(crate) ssb_cursor: usize,
    /// Sequential store buffer: slot addresses recorded by the barrier.
    pub(crate) ssb: Box<[Address; STORE_REMSET_BUFFER_SIZE]>,
    pub(crate) thread: ThreadId,
    /// Set when the thread stopped acknowledging handshakes; later passes
    /// ignore it.
    pub(crate) skip: bool,
    /// Allocations by this thread, for the collect-before-allocs debug flag.
    pub(crate) alloc_count: usize,
}

/// Field offsets for runtime code generators.
pub fn mutator_tlab_cursor_offset() -> usize {
    memoffset::offset_of!(Mutator, tlab_cursor)
}

pub fn mutator_tlab_limit_offset() -> usize {
    memoffset::offset_of!(Mutator, tlab_limit)
}

pub fn mutator_ssb_cursor_offset() -> usize {
    memoffset::offset_of!(Mutator, ssb_cursor)
}

pub fn mutator_ssb_offset() -> usize {
    memoffset::offset_of!(Mutator, ssb)
}

impl Mutator {
    pub(crate) fn new(thread: ThreadId) -> Mutator {
        Mutator {
            tlab_cursor: Address::zero(),
            tlab_limit: Address::zero(),
            ssb_cursor: 0,
            ssb: Box::new([Address::zero(); STORE_REMSET_BUFFER_SIZE]),
            thread,
            skip: false,
            alloc_count: 0,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Bump-allocate from the TLAB. The returned memory is already zeroed;
    /// the caller only writes the vtable word.
    pub(crate) fn tlab_alloc(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size % ALLOC_ALIGN == 0);
        let result = self.tlab_cursor;
        if result.is_zero() || result + size > self.tlab_limit {
            return None;
        }
        self.tlab_cursor = result + size;
        Some(result)
    }

    /// Fill the unused TLAB tail so the nursery stays walkable, and drop the
    /// TLAB. Collection entry; runs while the thread is stopped.
    pub(crate) fn retire_tlab(&mut self) {
        if !self.tlab_cursor.is_zero() && self.tlab_cursor < self.tlab_limit {
            object_header::write_filler(self.tlab_cursor, self.tlab_limit - self.tlab_cursor);
        }
        self.tlab_cursor = Address::zero();
        self.tlab_limit = Address::zero();
    }

    pub(crate) fn adopt_tlab(&mut self, start: Address, limit: Address) {
        debug_assert!(self.tlab_cursor.is_zero());
        self.tlab_cursor = start;
        self.tlab_limit = limit;
    }
}

struct MutatorPtr(*mut Mutator);

// Mutator pointers are only dereferenced by their owning thread or by the
// collection owner while the owning thread is stopped.
unsafe impl Send for MutatorPtr {}
unsafe impl Sync for MutatorPtr {}

/// All registered mutator threads.
pub struct ThreadRegistry {
    mutators: Mutex<Vec<MutatorPtr>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry {
            mutators: Mutex::new(vec![]),
        }
    }

    pub fn register(&self, mutator: *mut Mutator) {
        self.mutators.lock().unwrap().push(MutatorPtr(mutator));
    }

    pub fn unregister(&self, mutator: *mut Mutator) {
        self.mutators
            .lock()
            .unwrap()
            .retain(|m| !std::ptr::eq(m.0, mutator));
    }

    pub fn count(&self) -> usize {
        self.mutators.lock().unwrap().len()
    }

    /// Visit every registered mutator.
    ///
    /// # Safety
    /// The caller must guarantee no mutator is concurrently touching its own
    /// context: either the world is stopped or the visited state is owned by
    /// the registry (the `skip` flag).
    pub unsafe fn for_each(&self, mut f: impl FnMut(&mut Mutator)) {
        for m in self.mutators.lock().unwrap().iter() {
            f(&mut *m.0)
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory;

    #[test]
    fn tlab_bump_and_exhaust() {
        let area = memory::dzmmap(BYTES_IN_PAGE).unwrap();
        let mut m = Mutator::new(ThreadId(1));
        assert!(m.tlab_alloc(16).is_none());
        m.adopt_tlab(area, area + 64usize);
        let a = m.tlab_alloc(16).unwrap();
        let b = m.tlab_alloc(16).unwrap();
        assert_eq!(b, a + 16usize);
        assert!(m.tlab_alloc(64).is_none());
        m.retire_tlab();
        assert!(m.tlab_cursor.is_zero());
    }

    #[test]
    fn published_offsets_are_stable_order() {
        assert_eq!(mutator_tlab_cursor_offset(), 0);
        assert_eq!(mutator_tlab_limit_offset(), BYTES_IN_WORD);
        assert!(mutator_ssb_cursor_offset() < mutator_ssb_offset());
    }

    #[test]
    fn registry_register_unregister() {
        let reg = ThreadRegistry::new();
        let mut m = Mutator::new(ThreadId(7));
        reg.register(&mut m);
        assert_eq!(reg.count(), 1);
        let mut seen = 0;
        unsafe { reg.for_each(|mm| seen += mm.thread().0) };
        assert_eq!(seen, 7);
        reg.unregister(&mut m);
        assert_eq!(reg.count(), 0);
    }
}
