//! Registered root ranges.
//!
//! Three disjoint tables keyed by range start: *normal* (precise), *pinned*
//! (conservative, no descriptor), and *wbarrier* (precise, tracked by the
//! write barrier). Registration replaces any existing entry with the same
//! start, so a runtime can re-register thread locals with a new size or
//! descriptor; deregistration searches all tables.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;
use crate::vm::{walk_slots, Descriptor};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RootKind {
    Normal,
    Pinned,
    WBarrier,
}

impl RootKind {
    fn index(self) -> usize {
        match self {
            RootKind::Normal => 0,
            RootKind::Pinned => 1,
            RootKind::WBarrier => 2,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct RootRecord {
    end: Address,
    /// EMPTY for pinned roots, which carry no descriptor.
    descriptor: Descriptor,
}

pub struct RootRegistry {
    tables: Mutex<[HashMap<Address, RootRecord>; 3]>,
}

impl RootRegistry {
    pub fn new() -> Self {
        RootRegistry {
            tables: Mutex::new([HashMap::new(), HashMap::new(), HashMap::new()]),
        }
    }

    pub fn register(&self, start: Address, size: usize, descriptor: Descriptor, kind: RootKind) {
        debug_assert!(!start.is_zero() && size > 0);
        let mut tables = self.tables.lock().unwrap();
        for table in tables.iter_mut() {
            table.remove(&start);
        }
        tables[kind.index()].insert(
            start,
            RootRecord {
                end: start + size,
                descriptor,
            },
        );
    }

    /// Remove a root range, whatever its kind. Returns false when the start
    /// was never registered (tolerated; the runtime may double-free roots
    /// during teardown).
    pub fn deregister(&self, start: Address) -> bool {
        let mut tables = self.tables.lock().unwrap();
        let mut removed = false;
        for table in tables.iter_mut() {
            removed |= table.remove(&start).is_some();
        }
        removed
    }

    pub fn count(&self, kind: RootKind) -> usize {
        self.tables.lock().unwrap()[kind.index()].len()
    }

    /// Walk every reference slot of the precise tables of `kind`, relaying
    /// slot addresses in registration-table order. `kind` must not be
    /// `Pinned`.
    pub fn scan_precise(&self, kind: RootKind, relay: &mut dyn FnMut(Address)) {
        debug_assert!(kind != RootKind::Pinned);
        let tables = self.tables.lock().unwrap();
        for (&start, record) in tables[kind.index()].iter() {
            let words = (record.end - start) / BYTES_IN_WORD;
            walk_slots(record.descriptor, start, words, relay);
        }
    }

    /// Report each conservative (pinned-kind) range.
    pub fn conservative_ranges(&self, report: &mut dyn FnMut(Address, Address)) {
        let tables = self.tables.lock().unwrap();
        for (&start, record) in tables[RootKind::Pinned.index()].iter() {
            report(start, record.end);
        }
    }
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_WORD;

    #[test]
    fn register_replaces_across_kinds() {
        let r = RootRegistry::new();
        let start = Address::from_usize(0x1000);
        r.register(start, 64, Descriptor::bitmap(0b1), RootKind::Normal);
        assert_eq!(r.count(RootKind::Normal), 1);
        // Same start re-registered as a wbarrier root replaces the old entry.
        r.register(start, 128, Descriptor::bitmap(0b10), RootKind::WBarrier);
        assert_eq!(r.count(RootKind::Normal), 0);
        assert_eq!(r.count(RootKind::WBarrier), 1);
        assert!(r.deregister(start));
        assert!(!r.deregister(start));
    }

    #[test]
    fn precise_scan_relays_descriptor_slots() {
        let r = RootRegistry::new();
        let backing: Vec<usize> = vec![0; 8];
        let start = Address::from_ptr(backing.as_ptr());
        r.register(
            start,
            8 * BYTES_IN_WORD,
            Descriptor::bitmap(0b101),
            RootKind::Normal,
        );
        let mut slots = vec![];
        r.scan_precise(RootKind::Normal, &mut |s| slots.push(s));
        slots.sort();
        assert_eq!(slots, vec![start, start + 2 * BYTES_IN_WORD]);
    }

    #[test]
    fn conservative_ranges_reported() {
        let r = RootRegistry::new();
        let start = Address::from_usize(0x2000);
        r.register(start, 256, Descriptor::EMPTY, RootKind::Pinned);
        let mut seen = vec![];
        r.conservative_ranges(&mut |s, e| seen.push((s, e)));
        assert_eq!(seen, vec![(start, start + 256usize)]);
    }
}
