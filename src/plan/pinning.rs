//! The pin queue: candidate addresses gathered by conservative scanning
//! during stop-the-world.
//!
//! Gathering appends under a spin lock (parallel collectors may enqueue
//! concurrently); everything after `sort_and_dedupe` runs on the collection
//! owner thread. Once each section has resolved its sub-range to object
//! starts, the queue is compacted to hold exactly the definitively pinned
//! objects, which the nursery fragment rebuild then walks.

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

pub struct PinQueue {
    entries: spin::Mutex<Vec<Address>>,
}

impl PinQueue {
    pub fn new() -> Self {
        PinQueue {
            entries: spin::Mutex::new(vec![]),
        }
    }

    pub fn push(&self, addr: Address) {
        self.entries.lock().push(addr);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sort ascending and drop duplicate candidate addresses in place.
    pub fn sort_and_dedupe(&self) {
        let mut entries = self.entries.lock();
        entries.sort_unstable();
        entries.dedup();
    }

    /// Index range of the sorted queue whose addresses fall in
    /// `[start, end)`. Call after `sort_and_dedupe`.
    pub fn find_section_range(&self, start: Address, end: Address) -> std::ops::Range<usize> {
        let entries = self.entries.lock();
        debug_assert!(entries.windows(2).all(|w| w[0] < w[1]));
        let lo = entries.partition_point(|&a| a < start);
        let hi = entries.partition_point(|&a| a < end);
        lo..hi
    }

    /// Run `f` over the candidate addresses of a section sub-range.
    pub fn with_range<R>(&self, range: std::ops::Range<usize>, f: impl FnOnce(&[Address]) -> R) -> R {
        let entries = self.entries.lock();
        f(&entries[range])
    }

    /// Compact the queue to the definitively pinned object starts
    /// (ascending).
    pub fn set_resolved(&self, resolved: Vec<Address>) {
        debug_assert!(resolved.windows(2).all(|w| w[0] < w[1]));
        *self.entries.lock() = resolved;
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for PinQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Conservatively treat every word of `[start, end)` as a candidate pointer
/// and queue the ones landing in `[filter_lo, filter_hi)`. Reads go through
/// a byte pointer so arbitrary memory (foreign stacks, register dumps) never
/// becomes a typed Rust reference.
pub fn pin_from_range(
    queue: &PinQueue,
    start: Address,
    end: Address,
    filter_lo: Address,
    filter_hi: Address,
) -> usize {
    let mut found = 0;
    let mut cursor = start.align_up(BYTES_IN_WORD);
    while cursor + BYTES_IN_WORD <= end {
        let word = unsafe {
            std::ptr::read_unaligned(cursor.to_ptr::<u8>() as *const usize)
        };
        let candidate = Address::from_usize(word);
        if candidate >= filter_lo && candidate < filter_hi {
            queue.push(candidate);
            found += 1;
        }
        cursor = cursor + BYTES_IN_WORD;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: usize) -> Address {
        Address::from_usize(a)
    }

    #[test]
    fn sort_dedupe_and_partition() {
        let q = PinQueue::new();
        for a in [0x5008, 0x1000, 0x5008, 0x3000, 0x2ff8, 0x1000] {
            q.push(addr(a));
        }
        q.sort_and_dedupe();
        assert_eq!(q.len(), 4);
        let range = q.find_section_range(addr(0x2000), addr(0x5000));
        assert_eq!(range, 1..3);
        q.with_range(range, |slice| {
            assert_eq!(slice, &[addr(0x2ff8), addr(0x3000)]);
        });
    }

    #[test]
    fn resolved_replaces_candidates() {
        let q = PinQueue::new();
        q.push(addr(0x1010));
        q.push(addr(0x1018)); // same object, different interior words
        q.sort_and_dedupe();
        q.set_resolved(vec![addr(0x1000)]);
        assert_eq!(q.len(), 1);
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn conservative_range_filters() {
        let fake_stack: Vec<usize> = vec![0x10, 0x8000, 0x9ff8, 0xa000, 0xdead];
        let start = Address::from_ptr(fake_stack.as_ptr());
        let end = start + fake_stack.len() * BYTES_IN_WORD;
        let q = PinQueue::new();
        let found = pin_from_range(&q, start, end, addr(0x8000), addr(0xa000));
        assert_eq!(found, 2);
        q.sort_and_dedupe();
        q.with_range(0..q.len(), |slice| {
            assert_eq!(slice, &[addr(0x8000), addr(0x9ff8)]);
        });
    }
}
