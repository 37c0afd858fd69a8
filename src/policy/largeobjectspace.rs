//! The large-object store.
//!
//! Objects above `MAX_SMALL_OBJ_SIZE` get their own page-granular mapping
//! and never move. Minor collections leave the store alone (old→young
//! pointers out of it arrive through the write barrier like any other old
//! slot); a major collection marks through it and the sweep unpins the
//! survivors and unmaps the rest.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::util::constants::*;
use crate::util::heap::HeapBounds;
use crate::util::object_header;
use crate::util::{memory, Address, ObjectReference};

struct LosEntry {
    start: Address,
    size: usize,
    map_bytes: usize,
}

pub struct LargeObjectSpace {
    /// Ascending by start.
    entries: Mutex<Vec<LosEntry>>,
    used_bytes: AtomicUsize,
    /// Bytes allocated here since the last major collection, for the
    /// need-major predicate.
    alloced_since_major: AtomicUsize,
}

impl LargeObjectSpace {
    pub fn new() -> Self {
        LargeObjectSpace {
            entries: Mutex::new(vec![]),
            used_bytes: AtomicUsize::new(0),
            alloced_since_major: AtomicUsize::new(0),
        }
    }

    /// Allocate a zeroed large object of `size` bytes.
    pub fn allocate(&self, size: usize, bounds: &HeapBounds) -> Option<Address> {
        debug_assert!(size > MAX_SMALL_OBJ_SIZE);
        let map_bytes = crate::util::conversions::raw_align_up(size, BYTES_IN_PAGE);
        let start = match memory::dzmmap(map_bytes) {
            Ok(start) => start,
            Err(e) => {
                warn!("large object mmap of {} bytes failed: {}", map_bytes, e);
                return None;
            }
        };
        bounds.record_range(start, start + map_bytes);
        let mut entries = self.entries.lock().unwrap();
        let idx = entries.partition_point(|e| e.start < start);
        entries.insert(
            idx,
            LosEntry {
                start,
                size,
                map_bytes,
            },
        );
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.alloced_since_major.fetch_add(size, Ordering::Relaxed);
        Some(start)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.find_object_start(addr).is_some()
    }

    pub fn find_object_start(&self, addr: Address) -> Option<ObjectReference> {
        let entries = self.entries.lock().unwrap();
        let idx = entries.partition_point(|e| e.start <= addr);
        if idx == 0 {
            return None;
        }
        let entry = &entries[idx - 1];
        if addr < entry.start + entry.size {
            Some(unsafe { ObjectReference::from_raw_address_unchecked(entry.start) })
        } else {
            None
        }
    }

    pub fn iterate_objects(&self, f: &mut dyn FnMut(ObjectReference)) {
        let starts: Vec<Address> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().map(|e| e.start).collect()
        };
        for start in starts {
            f(unsafe { ObjectReference::from_raw_address_unchecked(start) });
        }
    }

    /// Major-collection sweep: unpin and unmark survivors, free the rest.
    /// Returns the bytes freed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut freed = 0;
        entries.retain(|entry| {
            let object = unsafe { ObjectReference::from_raw_address_unchecked(entry.start) };
            if object_header::is_marked(object) {
                object_header::clear_mark(object);
                object_header::clear_pin(object);
                true
            } else {
                freed += entry.size;
                if let Err(e) = memory::munmap(entry.start, entry.map_bytes) {
                    warn!("failed to unmap large object at {}: {}", entry.start, e);
                }
                false
            }
        });
        self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
        self.alloced_since_major.store(0, Ordering::Relaxed);
        freed
    }

    pub fn used_space(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn alloced_since_major(&self) -> usize {
        self.alloced_since_major.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::fake_vtable;

    #[test]
    fn allocate_find_and_sweep() {
        let los = LargeObjectSpace::new();
        let bounds = HeapBounds::new();
        let a = los.allocate(MAX_SMALL_OBJ_SIZE + 8, &bounds).unwrap();
        let b = los.allocate(3 * MAX_SMALL_OBJ_SIZE, &bounds).unwrap();
        unsafe {
            a.store(fake_vtable());
            b.store(fake_vtable());
        }
        assert_eq!(los.entry_count(), 2);
        assert!(los.contains(a + 100usize));
        assert_eq!(
            los.find_object_start(b + MAX_SMALL_OBJ_SIZE)
                .unwrap()
                .to_raw_address(),
            b
        );
        let keep = unsafe { ObjectReference::from_raw_address_unchecked(a) };
        object_header::attempt_mark(keep);
        object_header::attempt_pin(keep);
        let freed = los.sweep();
        assert_eq!(freed, 3 * MAX_SMALL_OBJ_SIZE);
        assert_eq!(los.entry_count(), 1);
        assert!(!object_header::is_marked(keep));
        assert!(!object_header::is_pinned(keep));
        assert_eq!(los.used_space(), MAX_SMALL_OBJ_SIZE + 8);
        assert_eq!(los.alloced_since_major(), 0);
    }
}
