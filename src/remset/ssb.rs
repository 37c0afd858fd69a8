//! Sequential store buffer backend.
//!
//! Each mutator owns a fixed-length buffer of slot addresses; the barrier
//! pushes and flushes to a global log on overflow. Ranges too long for the
//! buffer are logged as `(start, words)` pairs instead of being expanded.

use std::sync::Mutex;

use crate::plan::mutator::{Mutator, ThreadRegistry};
use crate::remset::{CardSlotSource, RememberedSet};
use crate::util::constants::*;
use crate::util::Address;

pub struct SequentialStoreBuffer {
    global: Mutex<Vec<Address>>,
    global_ranges: Mutex<Vec<(Address, usize)>>,
}

impl SequentialStoreBuffer {
    pub fn new() -> Self {
        SequentialStoreBuffer {
            global: Mutex::new(vec![]),
            global_ranges: Mutex::new(vec![]),
        }
    }

    fn flush_buffer(&self, mutator: &mut Mutator) {
        if mutator.ssb_cursor == 0 {
            return;
        }
        let mut global = self.global.lock().unwrap();
        global.extend_from_slice(&mutator.ssb[..mutator.ssb_cursor]);
        mutator.ssb_cursor = 0;
    }
}

impl Default for SequentialStoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RememberedSet for SequentialStoreBuffer {
    fn record_pointer(&self, mutator: &mut Mutator, slot: Address) {
        if mutator.ssb_cursor == STORE_REMSET_BUFFER_SIZE {
            self.flush_buffer(mutator);
        }
        mutator.ssb[mutator.ssb_cursor] = slot;
        mutator.ssb_cursor += 1;
    }

    fn record_range(&self, mutator: &mut Mutator, start: Address, words: usize) {
        if words >= STORE_REMSET_BUFFER_SIZE {
            self.global_ranges.lock().unwrap().push((start, words));
            return;
        }
        for i in 0..words {
            self.record_pointer(mutator, start + i * BYTES_IN_WORD);
        }
    }

    fn record_global(&self, slot: Address) {
        self.global.lock().unwrap().push(slot);
    }

    fn begin_scan_remsets(&self) {}

    fn finish_scan_remsets(
        &self,
        threads: &ThreadRegistry,
        _source: &dyn CardSlotSource,
        visit: &mut dyn FnMut(Address),
    ) {
        // The world is stopped; drain the per-thread buffers first.
        unsafe {
            threads.for_each(|m| self.flush_buffer(m));
        }
        // Collector-side records keep arriving while promoted objects are
        // scanned, so drain to a fixpoint.
        loop {
            let drained = std::mem::take(&mut *self.global.lock().unwrap());
            let ranges = std::mem::take(&mut *self.global_ranges.lock().unwrap());
            if drained.is_empty() && ranges.is_empty() {
                break;
            }
            for slot in drained {
                visit(slot);
            }
            for (start, words) in ranges {
                for i in 0..words {
                    visit(start + i * BYTES_IN_WORD);
                }
            }
        }
    }

    fn prepare_for_minor_collection(&self, _threads: &ThreadRegistry) {}

    fn prepare_for_major_collection(&self, threads: &ThreadRegistry) {
        unsafe {
            threads.for_each(|m| m.ssb_cursor = 0);
        }
        self.global.lock().unwrap().clear();
        self.global_ranges.lock().unwrap().clear();
    }

    fn finish_minor_collection(&self) {
        // Entries recorded by the post-passes (old slots left pointing at
        // pinned nursery survivors) stay queued for the next minor scan.
    }

    fn register_thread(&self, mutator: &mut Mutator) {
        mutator.ssb_cursor = 0;
    }

    fn cleanup_thread(&self, mutator: &mut Mutator) {
        self.flush_buffer(mutator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ThreadId;

    struct NoCards;
    impl CardSlotSource for NoCards {
        fn enumerate_ref_slots(
            &self,
            _start: Address,
            _end: Address,
            _visit: &mut dyn FnMut(Address),
        ) {
        }
    }

    #[test]
    fn records_flush_and_deliver() {
        let ssb = SequentialStoreBuffer::new();
        let threads = ThreadRegistry::new();
        let mut m = Mutator::new(ThreadId(1));
        threads.register(&mut m);
        for i in 0..(STORE_REMSET_BUFFER_SIZE + 10) {
            ssb.record_pointer(&mut m, Address::from_usize(0x10000 + i * 8));
        }
        assert_eq!(m.ssb_cursor, 10);
        let mut seen = vec![];
        ssb.finish_scan_remsets(&threads, &NoCards, &mut |s| seen.push(s));
        assert_eq!(seen.len(), STORE_REMSET_BUFFER_SIZE + 10);
        assert_eq!(m.ssb_cursor, 0);
        threads.unregister(&mut m);
    }

    #[test]
    fn long_ranges_stay_compact() {
        let ssb = SequentialStoreBuffer::new();
        let threads = ThreadRegistry::new();
        let mut m = Mutator::new(ThreadId(1));
        ssb.record_range(&mut m, Address::from_usize(0x2000), STORE_REMSET_BUFFER_SIZE * 2);
        assert_eq!(m.ssb_cursor, 0);
        let mut seen = 0;
        ssb.finish_scan_remsets(&threads, &NoCards, &mut |_| seen += 1);
        assert_eq!(seen, STORE_REMSET_BUFFER_SIZE * 2);
    }

    #[test]
    fn global_records_drain_to_fixpoint() {
        let ssb = SequentialStoreBuffer::new();
        let threads = ThreadRegistry::new();
        ssb.record_global(Address::from_usize(0x3000));
        let mut first = true;
        let mut seen = vec![];
        ssb.finish_scan_remsets(&threads, &NoCards, &mut |s| {
            seen.push(s);
            if first {
                first = false;
                ssb.record_global(Address::from_usize(0x4000));
            }
        });
        assert_eq!(
            seen,
            vec![Address::from_usize(0x3000), Address::from_usize(0x4000)]
        );
    }
}
