//! Copying old generation.
//!
//! The old space is a list of bump-filled blocks. A major collection flips
//! to an empty to-space block list and evacuates survivors by
//! copy-forwarding, exactly like minor promotion. Pinned survivors cannot
//! move: their from-space blocks are retained in place with dead ranges
//! rewritten as filler, and are reclaimed in a later cycle once the pins
//! die. Because evacuation cannot honour in-place pinned *allocation*,
//! `alloc_pinned` routes to the large-object store for this backend.
//!
//! Blocks are object-walkable: a retiring block gets its tail filled, so a
//! linear scan from the block start steps object-by-object.

use std::sync::Mutex;

use crate::policy::major::{MajorCapabilities, MajorHeap, SweepStats};
use crate::util::constants::*;
use crate::util::conversions::{align_object_size, raw_align_up};
use crate::util::heap::HeapBounds;
use crate::util::object_header::{self, ForwardingClaim};
use crate::util::{memory, Address, ObjectReference};
use crate::vm::Runtime;

#[derive(Copy, Clone)]
struct CopyBlock {
    start: Address,
    /// Bump level. Retired blocks have their tail filled and top == end.
    top: Address,
}

impl CopyBlock {
    fn end(&self) -> Address {
        self.start + MAJOR_BLOCK_SIZE
    }
}

struct CpInner {
    commit_cursor: Address,
    /// Live blocks, ascending by start. The current bump target is the one
    /// whose top is below its end.
    blocks: Vec<CopyBlock>,
    current: Option<usize>,
    /// To-space while a major collection is running.
    evac: Vec<CopyBlock>,
    evac_current: Option<usize>,
    in_major: bool,
    recycled: Vec<Address>,
    used_bytes: usize,
}

pub struct CopyingHeap {
    region_start: Address,
    region_end: Address,
    inner: Mutex<CpInner>,
}

impl CopyingHeap {
    pub fn new(reserve_bytes: usize, bounds: &HeapBounds) -> std::io::Result<CopyingHeap> {
        let reserve = raw_align_up(reserve_bytes, MAJOR_BLOCK_SIZE);
        let region_start = memory::mmap_reserve(reserve)?;
        let region_end = region_start + reserve;
        bounds.record_range(region_start, region_end);
        Ok(CopyingHeap {
            region_start,
            region_end,
            inner: Mutex::new(CpInner {
                commit_cursor: region_start,
                blocks: vec![],
                current: None,
                evac: vec![],
                evac_current: None,
                in_major: false,
                recycled: vec![],
                used_bytes: 0,
            }),
        })
    }

    fn grab_block(inner: &mut CpInner, region_end: Address) -> Option<Address> {
        if let Some(start) = inner.recycled.pop() {
            return Some(start);
        }
        if inner.commit_cursor + MAJOR_BLOCK_SIZE > region_end {
            return None;
        }
        let start = inner.commit_cursor;
        if memory::commit(start, MAJOR_BLOCK_SIZE).is_err() {
            return None;
        }
        inner.commit_cursor = start + MAJOR_BLOCK_SIZE;
        Some(start)
    }

    fn retire(block: &mut CopyBlock) {
        if block.top < block.end() {
            object_header::write_filler(block.top, block.end() - block.top);
            block.top = block.end();
        }
    }

    fn bump(inner: &mut CpInner, region_end: Address, size: usize) -> Option<Address> {
        let in_major = inner.in_major;
        loop {
            let (list, current) = if in_major {
                (&mut inner.evac, &mut inner.evac_current)
            } else {
                (&mut inner.blocks, &mut inner.current)
            };
            if let Some(idx) = *current {
                let block = &mut list[idx];
                if block.top + size <= block.end() {
                    let result = block.top;
                    block.top = result + size;
                    return Some(result);
                }
                Self::retire(block);
                *current = None;
            }
            let start = Self::grab_block(inner, region_end)?;
            let block = CopyBlock { start, top: start };
            let (list, current) = if in_major {
                (&mut inner.evac, &mut inner.evac_current)
            } else {
                (&mut inner.blocks, &mut inner.current)
            };
            // current is always None here: it was either never set or was
            // cleared when the previous block retired.
            debug_assert!(current.is_none());
            let idx = list.partition_point(|b| b.start < start);
            list.insert(idx, block);
            *current = Some(idx);
        }
    }

    fn find_block(blocks: &[CopyBlock], addr: Address) -> Option<usize> {
        let idx = blocks.partition_point(|b| b.start <= addr);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        if addr < blocks[idx].end() {
            Some(idx)
        } else {
            None
        }
    }

    /// Walk the objects of one block, reporting non-filler starts.
    fn walk_block(
        rt: &dyn Runtime,
        block: &CopyBlock,
        mut f: impl FnMut(ObjectReference, usize),
    ) {
        let mut cursor = block.start;
        while cursor < block.top {
            let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
            let size = raw_align_up(object_header::object_size(rt, object), ALLOC_ALIGN);
            f(object, size);
            cursor = cursor + size;
        }
    }
}

impl MajorHeap for CopyingHeap {
    fn capabilities(&self) -> MajorCapabilities {
        MajorCapabilities {
            parallel: false,
            cardtable: true,
            pinned_alloc_in_place: false,
            fixed_heap: false,
        }
    }

    fn allocate(&self, size: usize) -> Option<Address> {
        let size = align_object_size(size);
        let mut inner = self.inner.lock().unwrap();
        let result = Self::bump(&mut inner, self.region_end, size)?;
        inner.used_bytes += size;
        Some(result)
    }

    fn contains(&self, addr: Address) -> bool {
        if addr < self.region_start || addr >= self.region_end {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        Self::find_block(&inner.blocks, addr).is_some()
            || (inner.in_major && Self::find_block(&inner.evac, addr).is_some())
    }

    fn find_object_start(&self, rt: &dyn Runtime, addr: Address) -> Option<ObjectReference> {
        let inner = self.inner.lock().unwrap();
        let idx = Self::find_block(&inner.blocks, addr)?;
        let mut found = None;
        Self::walk_block(rt, &inner.blocks[idx], |object, size| {
            let start = object.to_raw_address();
            if start <= addr && addr < start + size && !object_header::is_filler(object) {
                found = Some(object);
            }
        });
        found
    }

    fn iterate_objects(&self, rt: &dyn Runtime, f: &mut dyn FnMut(ObjectReference)) {
        self.enumerate_objects_in(rt, self.region_start, self.region_end, f)
    }

    fn enumerate_objects_in(
        &self,
        rt: &dyn Runtime,
        start: Address,
        end: Address,
        f: &mut dyn FnMut(ObjectReference),
    ) {
        let mut gathered = vec![];
        {
            let inner = self.inner.lock().unwrap();
            let first = inner.blocks.partition_point(|b| b.end() <= start);
            for block in inner.blocks[first..].iter() {
                if block.start >= end {
                    break;
                }
                Self::walk_block(rt, block, |object, size| {
                    let ostart = object.to_raw_address();
                    if ostart < end
                        && ostart + size > start
                        && !object_header::is_filler(object)
                    {
                        gathered.push(object);
                    }
                });
            }
        }
        for object in gathered {
            f(object);
        }
    }

    fn mark_object(&self, rt: &dyn Runtime, object: ObjectReference) -> (ObjectReference, bool) {
        if object_header::is_pinned(object) {
            return (object, object_header::attempt_mark(object));
        }
        match object_header::attempt_to_forward(object) {
            ForwardingClaim::Forwarded(to) => (to, false),
            ForwardingClaim::Claimed(_) => {
                let size = object_header::object_size(rt, object);
                let to = self
                    .allocate(size)
                    .unwrap_or_else(|| panic!("old generation exhausted while evacuating {}", object));
                unsafe {
                    std::ptr::copy_nonoverlapping::<u8>(
                        object.to_raw_address().to_ptr(),
                        to.to_mut_ptr(),
                        size,
                    );
                }
                let new_object = unsafe { ObjectReference::from_raw_address_unchecked(to) };
                object_header::reset_forwarding_word(new_object, 0);
                object_header::install_forwarding(object, new_object);
                (new_object, true)
            }
        }
    }

    fn begin_major_collection(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.current.take() {
            Self::retire(&mut inner.blocks[idx]);
        }
        inner.in_major = true;
        inner.evac = vec![];
        inner.evac_current = None;
    }

    fn sweep(&self, rt: &dyn Runtime) -> SweepStats {
        let inner = &mut *self.inner.lock().unwrap();
        let mut kept = vec![];
        let mut live = 0;
        let mut swept = 0;
        for block in std::mem::take(&mut inner.blocks) {
            // Survivors in from-space can only be pinned objects; everything
            // else was either evacuated (forwarded) or is dead.
            let mut pinned_live = vec![];
            Self::walk_block(rt, &block, |object, size| {
                if object_header::is_filler(object) {
                    return;
                }
                if object_header::is_marked(object) {
                    debug_assert!(object_header::is_pinned(object));
                    pinned_live.push((object.to_raw_address(), size));
                } else {
                    swept += size;
                }
            });
            if pinned_live.is_empty() {
                memory::dontneed(block.start, MAJOR_BLOCK_SIZE);
                inner.recycled.push(block.start);
                continue;
            }
            // Keep the block in place; rewrite the dead gaps as filler.
            let mut cursor = block.start;
            for &(ostart, osize) in &pinned_live {
                if cursor < ostart {
                    object_header::write_filler(cursor, ostart - cursor);
                }
                let object = unsafe { ObjectReference::from_raw_address_unchecked(ostart) };
                object_header::clear_mark(object);
                object_header::clear_pin(object);
                live += osize;
                cursor = ostart + osize;
            }
            if cursor < block.end() {
                object_header::write_filler(cursor, block.end() - cursor);
            }
            kept.push(CopyBlock {
                start: block.start,
                top: block.end(),
            });
        }
        inner.blocks = kept;
        SweepStats {
            swept_bytes: swept,
            live_bytes: live,
        }
    }

    fn finish_major_collection(&self, rt: &dyn Runtime) {
        let inner = &mut *self.inner.lock().unwrap();
        debug_assert!(inner.in_major);
        if let Some(idx) = inner.evac_current.take() {
            Self::retire(&mut inner.evac[idx]);
        }
        let mut merged = std::mem::take(&mut inner.blocks);
        merged.append(&mut inner.evac);
        merged.sort_unstable_by_key(|b| b.start.as_usize());
        inner.blocks = merged;
        inner.current = None;
        inner.in_major = false;
        // Recompute occupancy from what actually survived.
        let mut used = 0;
        for block in &inner.blocks {
            Self::walk_block(rt, block, |object, size| {
                if !object_header::is_filler(object) {
                    used += size;
                }
            });
        }
        inner.used_bytes = used;
    }

    fn free_space(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let uncommitted = self.region_end - inner.commit_cursor;
        let recycled = inner.recycled.len() * MAJOR_BLOCK_SIZE;
        let tail = inner
            .current
            .map(|idx| inner.blocks[idx].end() - inner.blocks[idx].top)
            .unwrap_or(0);
        uncommitted + recycled + tail
    }

    fn used_space(&self) -> usize {
        self.inner.lock().unwrap().used_bytes
    }

    fn section_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let uncommitted = (self.region_end - inner.commit_cursor) / MAJOR_BLOCK_SIZE;
        (uncommitted + inner.recycled.len(), inner.blocks.len())
    }

    fn reserved_range(&self) -> (Address, Address) {
        (self.region_start, self.region_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{fake_vtable, MiniRuntime};

    #[test]
    fn bump_allocation_within_blocks() {
        let bounds = HeapBounds::new();
        let h = CopyingHeap::new(BYTES_IN_MBYTE, &bounds).unwrap();
        let a = h.allocate(64).unwrap();
        let b = h.allocate(64).unwrap();
        assert_eq!(b, a + 64usize);
        assert_eq!(h.used_space(), 128);
    }

    #[test]
    fn evacuation_forwards_unpinned() {
        let bounds = HeapBounds::new();
        let h = CopyingHeap::new(BYTES_IN_MBYTE, &bounds).unwrap();
        let rt = MiniRuntime::new(32);
        let a = h.allocate(32).unwrap();
        unsafe { a.store(fake_vtable()) };
        let obj = unsafe { ObjectReference::from_raw_address_unchecked(a) };
        h.begin_major_collection();
        let (moved, shaded) = h.mark_object(&rt, obj);
        assert!(shaded);
        assert_ne!(moved, obj);
        assert_eq!(object_header::forwarding_address(obj), Some(moved));
        // Idempotent on the second visit.
        let (again, shaded2) = h.mark_object(&rt, obj);
        assert!(!shaded2);
        assert_eq!(again, moved);
        h.sweep(&rt);
        h.finish_major_collection(&rt);
        assert_eq!(h.used_space(), 32);
        assert!(h.contains(moved.to_raw_address()));
        assert!(!h.contains(a));
    }

    #[test]
    fn pinned_survivors_hold_their_block() {
        let bounds = HeapBounds::new();
        let h = CopyingHeap::new(BYTES_IN_MBYTE, &bounds).unwrap();
        let rt = MiniRuntime::new(32);
        let a = h.allocate(32).unwrap();
        let b = h.allocate(32).unwrap();
        unsafe {
            a.store(fake_vtable());
            b.store(fake_vtable());
        }
        let pinned = unsafe { ObjectReference::from_raw_address_unchecked(b) };
        object_header::attempt_pin(pinned);
        h.begin_major_collection();
        let (kept, shaded) = h.mark_object(&rt, pinned);
        assert!(shaded);
        assert_eq!(kept, pinned);
        let stats = h.sweep(&rt);
        assert_eq!(stats.live_bytes, 32);
        assert_eq!(stats.swept_bytes, 32);
        h.finish_major_collection(&rt);
        // The pinned object is still there, unpinned for the next cycle, and
        // the dead neighbour turned into filler.
        assert!(!object_header::is_pinned(pinned));
        assert!(h.find_object_start(&rt, b + 8usize).is_some());
        assert!(h.find_object_start(&rt, a + 8usize).is_none());
    }
}
