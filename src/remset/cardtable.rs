//! Card table backend.
//!
//! One dirty byte per `CARD_SIZE` bytes of the old-generation region. A
//! store marks the covering card; the stop-the-world scan walks dirty
//! cards and asks the heap to enumerate the reference slots of objects
//! intersecting each card. Slots outside the covered region (large-object
//! store) fall back to an overflow log.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use crate::plan::mutator::{Mutator, ThreadRegistry};
use crate::remset::{CardSlotSource, RememberedSet};
use crate::util::constants::*;
use crate::util::Address;

pub struct CardTable {
    region_start: Address,
    region_end: Address,
    cards: Box<[AtomicU8]>,
    overflow: Mutex<Vec<Address>>,
    overflow_ranges: Mutex<Vec<(Address, usize)>>,
}

impl CardTable {
    /// Covers `[region_start, region_start + region_size)`, the old
    /// generation's reserved range.
    pub fn new(region_start: Address, region_size: usize) -> Self {
        let count = region_size >> CARD_BITS;
        let mut cards = Vec::with_capacity(count);
        cards.resize_with(count, || AtomicU8::new(0));
        CardTable {
            region_start,
            region_end: region_start + region_size,
            cards: cards.into_boxed_slice(),
            overflow: Mutex::new(vec![]),
            overflow_ranges: Mutex::new(vec![]),
        }
    }

    pub fn region(&self) -> (Address, Address) {
        (self.region_start, self.region_end)
    }

    fn card_index(&self, addr: Address) -> usize {
        (addr - self.region_start) >> CARD_BITS
    }

    fn covers(&self, addr: Address) -> bool {
        addr >= self.region_start && addr < self.region_end
    }

    fn dirty(&self, addr: Address) {
        self.cards[self.card_index(addr)].store(1, Ordering::Relaxed);
    }
}

impl RememberedSet for CardTable {
    fn record_pointer(&self, _mutator: &mut Mutator, slot: Address) {
        if self.covers(slot) {
            self.dirty(slot);
        } else {
            self.overflow.lock().unwrap().push(slot);
        }
    }

    fn record_range(&self, _mutator: &mut Mutator, start: Address, words: usize) {
        let end = start + words * BYTES_IN_WORD;
        if self.covers(start) && self.covers(end - 1usize) {
            let mut idx = self.card_index(start);
            let last = self.card_index(end - 1usize);
            while idx <= last {
                self.cards[idx].store(1, Ordering::Relaxed);
                idx += 1;
            }
        } else {
            self.overflow_ranges.lock().unwrap().push((start, words));
        }
    }

    fn record_global(&self, slot: Address) {
        if self.covers(slot) {
            self.dirty(slot);
        } else {
            self.overflow.lock().unwrap().push(slot);
        }
    }

    fn begin_scan_remsets(&self) {}

    fn finish_scan_remsets(
        &self,
        _threads: &ThreadRegistry,
        source: &dyn CardSlotSource,
        visit: &mut dyn FnMut(Address),
    ) {
        // Dirty cards may be re-marked by record_global while promoted
        // objects are scanned; loop until a pass finds nothing dirty.
        loop {
            let mut any = false;
            for idx in 0..self.cards.len() {
                if self.cards[idx].swap(0, Ordering::Relaxed) == 0 {
                    continue;
                }
                any = true;
                let card_start = self.region_start + (idx << CARD_BITS);
                let card_end = card_start + CARD_SIZE;
                source.enumerate_ref_slots(card_start, card_end, visit);
            }
            let overflow = std::mem::take(&mut *self.overflow.lock().unwrap());
            let ranges = std::mem::take(&mut *self.overflow_ranges.lock().unwrap());
            for slot in &overflow {
                visit(*slot);
            }
            for &(start, words) in &ranges {
                for i in 0..words {
                    visit(start + i * BYTES_IN_WORD);
                }
            }
            if !any && overflow.is_empty() && ranges.is_empty() {
                break;
            }
        }
    }

    fn prepare_for_minor_collection(&self, _threads: &ThreadRegistry) {}

    fn prepare_for_major_collection(&self, _threads: &ThreadRegistry) {
        for card in self.cards.iter() {
            card.store(0, Ordering::Relaxed);
        }
        self.overflow.lock().unwrap().clear();
        self.overflow_ranges.lock().unwrap().clear();
    }

    fn finish_minor_collection(&self) {}

    fn register_thread(&self, _mutator: &mut Mutator) {}

    fn cleanup_thread(&self, _mutator: &mut Mutator) {}

    fn is_card_table(&self) -> bool {
        true
    }

    fn card_table_info(&self) -> Option<(Address, Address)> {
        Some((Address::from_ptr(self.cards.as_ptr()), self.region_start))
    }
}
