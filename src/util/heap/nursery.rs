//! The nursery section.
//!
//! One contiguous power-of-two arena, mapped aligned to its own size so the
//! in-nursery test is a mask and compare. Allocation happens in fragments
//! (the live gaps between pinned survivors of the previous collection);
//! mutators carve TLABs out of the current fragment. A scan-start table with
//! one entry per `SCAN_START_SIZE` bucket supports resolving interior
//! pointers during pinning.
//!
//! Walkability invariant: between `clear_remaining_fragments` at the start
//! of a collection and `rebuild_fragments` at its end, every byte of the
//! nursery belongs to an object or a dead-area filler, so a linear scan from
//! `start` steps object-by-object to `end`.

use std::io;
use std::sync::Mutex;

use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use crate::util::object_header;
use crate::util::{memory, Address, ObjectReference};
use crate::vm::Runtime;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    pub start: Address,
    pub end: Address,
}

struct NurseryInner {
    /// Allocatable gaps, ascending, already zeroed.
    fragments: Vec<Fragment>,
    /// Index of the fragment currently being consumed.
    current: usize,
    /// One entry per SCAN_START_SIZE bucket: an object start at or before
    /// the first object of the bucket, or zero when unknown.
    scan_starts: Vec<Address>,
}

pub struct Nursery {
    start: Address,
    end: Address,
    size: usize,
    inner: Mutex<NurseryInner>,
}

impl Nursery {
    pub fn new(size: usize) -> io::Result<Nursery> {
        debug_assert!(size.is_power_of_two() && size >= MIN_NURSERY_SIZE);
        let start = memory::dzmmap_aligned(size, size)?;
        let end = start + size;
        let buckets = size / SCAN_START_SIZE;
        Ok(Nursery {
            start,
            end,
            size,
            inner: Mutex::new(NurseryInner {
                // The fresh arena is one big zeroed fragment.
                fragments: vec![Fragment { start, end }],
                current: 0,
                scan_starts: vec![Address::zero(); buckets],
            }),
        })
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// log2 of the section size, for inline barrier code generation.
    pub fn log_size(&self) -> usize {
        self.size.trailing_zeros() as usize
    }

    /// Mask-and-compare nursery membership test. The mask and base are
    /// published to runtime code generators for inline barrier fast paths.
    pub fn contains(&self, addr: Address) -> bool {
        (addr & !(self.size - 1)) == self.start.as_usize()
    }

    pub fn contains_object(&self, object: ObjectReference) -> bool {
        self.contains(object.to_raw_address())
    }

    /// Reserve a TLAB of at least `min` bytes (rounded up to `TLAB_SIZE`
    /// when the fragment allows). Returns the zeroed `[start, limit)` range,
    /// or None when no fragment can satisfy the request.
    pub fn alloc_tlab(&self, min: usize) -> Option<(Address, Address)> {
        debug_assert!(min % ALLOC_ALIGN == 0);
        let mut inner = self.inner.lock().unwrap();
        while inner.current < inner.fragments.len() {
            let idx = inner.current;
            let fragment = &mut inner.fragments[idx];
            let available = fragment.end - fragment.start;
            if available >= min {
                let take = min.max(TLAB_SIZE).min(available);
                let start = fragment.start;
                fragment.start = start + take;
                return Some((start, start + take));
            }
            // Too small for this request; fill the tail so the section stays
            // walkable and move on.
            if available > 0 {
                object_header::write_filler(fragment.start, available);
                fragment.start = fragment.end;
            }
            inner.current += 1;
        }
        None
    }

    /// Bytes still allocatable from the fragment list.
    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.fragments[inner.current.min(inner.fragments.len())..]
            .iter()
            .map(|f| f.end - f.start)
            .sum()
    }

    /// Collection entry: turn every unconsumed fragment byte into dead-area
    /// filler so the whole section is walkable. (Live TLAB tails are filled
    /// separately by the driver, which owns the mutator list.)
    pub fn clear_remaining_fragments(&self) {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current;
        for fragment in &mut inner.fragments[current..] {
            if fragment.start < fragment.end {
                object_header::write_filler(fragment.start, fragment.end - fragment.start);
                fragment.start = fragment.end;
            }
        }
        inner.current = inner.fragments.len();
    }

    /// Rebuild the scan-start table with one linear walk. Requires the
    /// walkability invariant.
    pub fn update_scan_starts(&self, rt: &dyn Runtime) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.scan_starts.iter_mut() {
            *entry = Address::zero();
        }
        let mut cursor = self.start;
        while cursor < self.end {
            let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
            let bucket = (cursor - self.start) / SCAN_START_SIZE;
            if inner.scan_starts[bucket].is_zero() {
                inner.scan_starts[bucket] = cursor;
            }
            let size = raw_align_up(object_header::object_size(rt, object), ALLOC_ALIGN);
            cursor = cursor + size;
        }
        debug_assert_eq!(cursor, self.end, "nursery walk overran the section");
    }

    /// Resolve a candidate interior pointer to the object containing it.
    /// Returns None for pointers into fillers or past the last object of a
    /// bucket run.
    pub fn find_object_for_ptr(
        &self,
        rt: &dyn Runtime,
        addr: Address,
    ) -> Option<ObjectReference> {
        debug_assert!(self.contains(addr));
        let inner = self.inner.lock().unwrap();
        let mut idx = (addr - self.start) / SCAN_START_SIZE;
        while inner.scan_starts[idx].is_zero() || inner.scan_starts[idx] > addr {
            if idx == 0 {
                return None;
            }
            idx -= 1;
        }
        let mut cursor = inner.scan_starts[idx];
        while cursor <= addr {
            let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
            let size = raw_align_up(object_header::object_size(rt, object), ALLOC_ALIGN);
            if addr < cursor + size {
                if object_header::is_filler(object) {
                    return None;
                }
                return Some(object);
            }
            cursor = cursor + size;
        }
        None
    }

    /// Rebuild the fragment list from the sorted pinned survivors
    /// (`(object start, aligned size)` pairs). Gaps below the usable minimum
    /// become filler; usable gaps are zeroed and become fragments. Returns
    /// the number of usable fragments; zero means degraded mode.
    pub fn rebuild_fragments(&self, pins: &[(Address, usize)], clear_at_gc: bool) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.fragments.clear();
        inner.current = 0;
        let mut cursor = self.start;
        let push_gap = |inner: &mut NurseryInner, start: Address, end: Address| {
            let len = end - start;
            if len == 0 {
                return;
            }
            if len >= MIN_FRAGMENT_SIZE {
                memory::zero(start, len);
                inner.fragments.push(Fragment { start, end });
            } else {
                if clear_at_gc {
                    memory::zero(start, len);
                }
                object_header::write_filler(start, len);
            }
        };
        for &(pin_start, pin_size) in pins {
            debug_assert!(self.contains(pin_start));
            debug_assert!(pin_start >= cursor, "pin queue not sorted");
            push_gap(&mut inner, cursor, pin_start);
            cursor = pin_start + raw_align_up(pin_size, ALLOC_ALIGN);
        }
        push_gap(&mut inner, cursor, self.end);
        inner.fragments.len()
    }

    /// Fragment list snapshot, for the consistency checker and heap dumps.
    pub fn fragment_snapshot(&self) -> Vec<Fragment> {
        let inner = self.inner.lock().unwrap();
        inner.fragments[inner.current.min(inner.fragments.len())..]
            .iter()
            .filter(|f| f.start < f.end)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlab_carving_consumes_fragments() {
        let n = Nursery::new(MIN_NURSERY_SIZE).unwrap();
        let (a, a_end) = n.alloc_tlab(64).unwrap();
        assert_eq!(a, n.start());
        assert_eq!(a_end - a, TLAB_SIZE);
        let (b, _) = n.alloc_tlab(64).unwrap();
        assert_eq!(b, a + TLAB_SIZE);
        // A request larger than TLAB_SIZE gets exactly what it asked for.
        let (c, c_end) = n.alloc_tlab(2 * TLAB_SIZE).unwrap();
        assert_eq!(c_end - c, 2 * TLAB_SIZE);
    }

    #[test]
    fn tlab_exhaustion() {
        let n = Nursery::new(MIN_NURSERY_SIZE).unwrap();
        let mut total = 0;
        while n.alloc_tlab(TLAB_SIZE).is_some() {
            total += TLAB_SIZE;
        }
        assert_eq!(total, MIN_NURSERY_SIZE);
        assert_eq!(n.free_bytes(), 0);
    }

    #[test]
    fn membership_is_mask_and_compare() {
        let n = Nursery::new(MIN_NURSERY_SIZE).unwrap();
        assert!(n.contains(n.start()));
        assert!(n.contains(n.end() - 1usize));
        assert!(!n.contains(n.end()));
        assert!(!n.contains(Address::zero()));
    }

    #[test]
    fn rebuild_covers_extent() {
        let n = Nursery::new(MIN_NURSERY_SIZE).unwrap();
        // Two fake pinned survivors.
        let p0 = n.start() + 4096usize;
        let p1 = n.start() + 10240usize;
        let usable = n.rebuild_fragments(&[(p0, 64), (p1, 128)], false);
        assert_eq!(usable, 3);
        let frags = n.fragment_snapshot();
        // Pins plus fragments tile the whole extent (filler-free case).
        assert_eq!(frags[0].start, n.start());
        assert_eq!(frags[0].end, p0);
        assert_eq!(frags[1].start, p0 + 64usize);
        assert_eq!(frags[1].end, p1);
        assert_eq!(frags[2].start, p1 + 128usize);
        assert_eq!(frags[2].end, n.end());
    }

    #[test]
    fn small_gap_becomes_filler_not_fragment() {
        let n = Nursery::new(MIN_NURSERY_SIZE).unwrap();
        let p0 = n.start() + 64usize; // gap of 64 bytes before the pin
        let usable = n.rebuild_fragments(&[(p0, 32)], false);
        assert_eq!(usable, 1);
        let frags = n.fragment_snapshot();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].start, p0 + 32usize);
    }
}
