//! Heap geometry: tracked bounds of every managed section.

pub mod nursery;

use atomic::{Atomic, Ordering};

use crate::util::Address;

/// The lowest/highest addresses of any managed section. Conservative scans
/// filter candidate words against this range before consulting the sections.
/// Updated by CAS because sections are created from multiple threads (LOS
/// allocation, major-heap growth).
pub struct HeapBounds {
    lowest: Atomic<Address>,
    highest: Atomic<Address>,
}

impl HeapBounds {
    pub fn new() -> Self {
        HeapBounds {
            lowest: Atomic::new(Address::max()),
            highest: Atomic::new(Address::zero()),
        }
    }

    pub fn record_range(&self, start: Address, end: Address) {
        debug_assert!(start < end);
        let mut low = self.lowest.load(Ordering::Relaxed);
        while start < low {
            match self.lowest.compare_exchange_weak(
                low,
                start,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => low = seen,
            }
        }
        let mut high = self.highest.load(Ordering::Relaxed);
        while end > high {
            match self.highest.compare_exchange_weak(
                high,
                end,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => high = seen,
            }
        }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.lowest.load(Ordering::Relaxed) && addr < self.highest.load(Ordering::Relaxed)
    }

    pub fn range(&self) -> (Address, Address) {
        (
            self.lowest.load(Ordering::Relaxed),
            self.highest.load(Ordering::Relaxed),
        )
    }
}

impl Default for HeapBounds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_grow_monotonically() {
        let b = HeapBounds::new();
        b.record_range(Address::from_usize(0x4000), Address::from_usize(0x5000));
        b.record_range(Address::from_usize(0x2000), Address::from_usize(0x3000));
        b.record_range(Address::from_usize(0x8000), Address::from_usize(0x9000));
        assert_eq!(
            b.range(),
            (Address::from_usize(0x2000), Address::from_usize(0x9000))
        );
        assert!(b.contains(Address::from_usize(0x4800)));
        assert!(!b.contains(Address::from_usize(0x9000)));
    }
}
