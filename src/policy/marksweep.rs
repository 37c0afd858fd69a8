//! Block-structured mark-sweep old generation.
//!
//! The reserved region is carved into `MAJOR_BLOCK_SIZE` blocks, each
//! dedicated to one size class. Allocation pops a free slot from a
//! partially filled block of the right class; marking is the header mark
//! tag; sweeping walks block slots, zeroes dead ones back onto the free
//! list and returns fully empty blocks to the OS (`MADV_DONTNEED`, which
//! also restores the zeroed-memory guarantee for reuse).
//!
//! The backend never moves objects, so pinning costs nothing here and
//! pinned allocation is served in place.

use std::sync::Mutex;

use crate::policy::major::{MajorCapabilities, MajorHeap, SweepStats};
use crate::util::constants::*;
use crate::util::conversions::align_object_size;
use crate::util::heap::HeapBounds;
use crate::util::object_header;
use crate::util::{memory, Address, ObjectReference};
use crate::vm::Runtime;

const SIZE_CLASSES: [usize; 18] = [
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144, 8192,
];

fn class_for(size: usize) -> usize {
    debug_assert!(size <= MAX_SMALL_OBJ_SIZE);
    SIZE_CLASSES.iter().position(|&c| c >= size).unwrap()
}

struct BlockMeta {
    start: Address,
    class: usize,
    /// Free slot starts, any order.
    free: Vec<Address>,
    used_slots: usize,
}

impl BlockMeta {
    fn slot_size(&self) -> usize {
        SIZE_CLASSES[self.class]
    }
}

struct MsInner {
    commit_cursor: Address,
    /// Live blocks, ascending by start.
    blocks: Vec<BlockMeta>,
    /// Empty block starts available for reuse (already returned to the OS).
    recycled: Vec<Address>,
    /// Per class: indices into `blocks` with free slots.
    partial: [Vec<usize>; SIZE_CLASSES.len()],
    used_bytes: usize,
}

pub struct MarkSweepHeap {
    region_start: Address,
    region_end: Address,
    fixed_heap: bool,
    parallel: bool,
    in_major: std::sync::atomic::AtomicBool,
    inner: Mutex<MsInner>,
}

impl MarkSweepHeap {
    pub fn new(
        reserve_bytes: usize,
        fixed_heap: bool,
        parallel: bool,
        bounds: &HeapBounds,
    ) -> std::io::Result<MarkSweepHeap> {
        let reserve = crate::util::conversions::raw_align_up(reserve_bytes, MAJOR_BLOCK_SIZE);
        let region_start = memory::mmap_reserve(reserve)?;
        let region_end = region_start + reserve;
        bounds.record_range(region_start, region_end);
        Ok(MarkSweepHeap {
            region_start,
            region_end,
            fixed_heap,
            parallel,
            in_major: std::sync::atomic::AtomicBool::new(false),
            inner: Mutex::new(MsInner {
                commit_cursor: region_start,
                blocks: vec![],
                recycled: vec![],
                partial: Default::default(),
                used_bytes: 0,
            }),
        })
    }

    fn acquire_block(inner: &mut MsInner, region_end: Address, class: usize) -> Option<usize> {
        let start = match inner.recycled.pop() {
            Some(start) => start,
            None => {
                if inner.commit_cursor + MAJOR_BLOCK_SIZE > region_end {
                    return None;
                }
                let start = inner.commit_cursor;
                if memory::commit(start, MAJOR_BLOCK_SIZE).is_err() {
                    return None;
                }
                inner.commit_cursor = start + MAJOR_BLOCK_SIZE;
                start
            }
        };
        let slot_size = SIZE_CLASSES[class];
        let count = MAJOR_BLOCK_SIZE / slot_size;
        let free = (0..count).rev().map(|i| start + i * slot_size).collect();
        let meta = BlockMeta {
            start,
            class,
            free,
            used_slots: 0,
        };
        let idx = inner.blocks.partition_point(|b| b.start < start);
        inner.blocks.insert(idx, meta);
        // Indices above the insertion point shifted by one.
        for list in inner.partial.iter_mut() {
            for i in list.iter_mut() {
                if *i >= idx {
                    *i += 1;
                }
            }
        }
        inner.partial[class].push(idx);
        Some(idx)
    }

    fn find_block(inner: &MsInner, addr: Address) -> Option<usize> {
        let idx = inner.blocks.partition_point(|b| b.start <= addr);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        if addr < inner.blocks[idx].start + MAJOR_BLOCK_SIZE {
            Some(idx)
        } else {
            None
        }
    }
}

impl MajorHeap for MarkSweepHeap {
    fn capabilities(&self) -> MajorCapabilities {
        MajorCapabilities {
            parallel: self.parallel,
            cardtable: true,
            pinned_alloc_in_place: true,
            fixed_heap: self.fixed_heap,
        }
    }

    fn allocate(&self, size: usize) -> Option<Address> {
        let size = align_object_size(size);
        let class = class_for(size);
        let mut inner = self.inner.lock().unwrap();
        let block_idx = match inner.partial[class].last().copied() {
            Some(idx) => idx,
            None => Self::acquire_block(&mut inner, self.region_end, class)?,
        };
        let slot_size = inner.blocks[block_idx].slot_size();
        let block = &mut inner.blocks[block_idx];
        let slot = block.free.pop().expect("partial block with no free slot");
        block.used_slots += 1;
        if block.free.is_empty() {
            inner.partial[class].retain(|&i| i != block_idx);
        }
        inner.used_bytes += slot_size;
        Some(slot)
    }

    fn contains(&self, addr: Address) -> bool {
        if addr < self.region_start || addr >= self.region_end {
            return false;
        }
        let inner = self.inner.lock().unwrap();
        Self::find_block(&inner, addr).is_some()
    }

    fn find_object_start(&self, _rt: &dyn Runtime, addr: Address) -> Option<ObjectReference> {
        let inner = self.inner.lock().unwrap();
        let idx = Self::find_block(&inner, addr)?;
        let block = &inner.blocks[idx];
        let slot_size = block.slot_size();
        let slot = block.start + ((addr - block.start) / slot_size) * slot_size;
        let vtable: Address = unsafe { slot.load() };
        if vtable.is_zero() {
            return None;
        }
        Some(unsafe { ObjectReference::from_raw_address_unchecked(slot) })
    }

    fn iterate_objects(&self, rt: &dyn Runtime, f: &mut dyn FnMut(ObjectReference)) {
        self.enumerate_objects_in(rt, self.region_start, self.region_end, f)
    }

    fn enumerate_objects_in(
        &self,
        _rt: &dyn Runtime,
        start: Address,
        end: Address,
        f: &mut dyn FnMut(ObjectReference),
    ) {
        // Gather under the lock, call back outside it: the callback is free
        // to allocate (promotion during a card scan).
        let mut gathered = vec![];
        {
            let inner = self.inner.lock().unwrap();
            let first = inner
                .blocks
                .partition_point(|b| b.start + MAJOR_BLOCK_SIZE <= start);
            for block in inner.blocks[first..].iter() {
                if block.start >= end {
                    break;
                }
                let slot_size = block.slot_size();
                let mut slot = if start > block.start {
                    // Include the slot whose object may span into the range.
                    block.start + ((start - block.start) / slot_size) * slot_size
                } else {
                    block.start
                };
                while slot < end && slot < block.start + MAJOR_BLOCK_SIZE {
                    let vtable: Address = unsafe { slot.load() };
                    if !vtable.is_zero() {
                        gathered.push(unsafe { ObjectReference::from_raw_address_unchecked(slot) });
                    }
                    slot = slot + slot_size;
                }
            }
        }
        for object in gathered {
            f(object);
        }
    }

    fn mark_object(&self, _rt: &dyn Runtime, object: ObjectReference) -> (ObjectReference, bool) {
        (object, object_header::attempt_mark(object))
    }

    fn promotion_tags(&self) -> usize {
        // Promotions that land here mid-major must survive the sweep.
        if self.in_major.load(std::sync::atomic::Ordering::Relaxed) {
            object_header::TAG_MARKED
        } else {
            0
        }
    }

    fn begin_major_collection(&self) {
        self.in_major
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn sweep(&self, _rt: &dyn Runtime) -> SweepStats {
        let mut inner = self.inner.lock().unwrap();
        let mut swept = 0;
        let mut live = 0;
        let mut emptied = vec![];
        for (idx, block) in inner.blocks.iter_mut().enumerate() {
            let slot_size = block.slot_size();
            block.free.clear();
            block.used_slots = 0;
            let mut slot = block.start;
            let block_end = block.start + MAJOR_BLOCK_SIZE;
            while slot < block_end {
                let vtable: Address = unsafe { slot.load() };
                if !vtable.is_zero() {
                    let object = unsafe { ObjectReference::from_raw_address_unchecked(slot) };
                    if object_header::is_marked(object) {
                        object_header::clear_mark(object);
                        object_header::clear_pin(object);
                        block.used_slots += 1;
                        live += slot_size;
                    } else {
                        memory::zero(slot, slot_size);
                        block.free.push(slot);
                        swept += slot_size;
                    }
                } else {
                    block.free.push(slot);
                }
                slot = slot + slot_size;
            }
            if block.used_slots == 0 {
                emptied.push(idx);
            }
        }
        // Return empty blocks to the OS and drop their metadata.
        for &idx in emptied.iter().rev() {
            let block = inner.blocks.remove(idx);
            memory::dontneed(block.start, MAJOR_BLOCK_SIZE);
            inner.recycled.push(block.start);
        }
        // Block indices changed wholesale; rebuild the partial lists.
        for list in inner.partial.iter_mut() {
            list.clear();
        }
        for idx in 0..inner.blocks.len() {
            if !inner.blocks[idx].free.is_empty() {
                let class = inner.blocks[idx].class;
                inner.partial[class].push(idx);
            }
        }
        inner.used_bytes = inner
            .blocks
            .iter()
            .map(|b| b.used_slots * b.slot_size())
            .sum();
        SweepStats {
            swept_bytes: swept,
            live_bytes: live,
        }
    }

    fn finish_major_collection(&self, _rt: &dyn Runtime) {
        self.in_major
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn free_space(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let uncommitted = self.region_end - inner.commit_cursor;
        let recycled = inner.recycled.len() * MAJOR_BLOCK_SIZE;
        let in_blocks: usize = inner
            .blocks
            .iter()
            .map(|b| b.free.len() * b.slot_size())
            .sum();
        uncommitted + recycled + in_blocks
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

    fn heap() -> MarkSweepHeap {
        let bounds = HeapBounds::new();
        MarkSweepHeap::new(4 * BYTES_IN_MBYTE, false, false, &bounds).unwrap()
    }

    #[test]
    fn size_class_selection() {
        assert_eq!(SIZE_CLASSES[class_for(16)], 16);
        assert_eq!(SIZE_CLASSES[class_for(17)], 32);
        assert_eq!(SIZE_CLASSES[class_for(8192)], 8192);
    }

    #[test]
    fn allocation_is_zeroed_and_classified() {
        let h = heap();
        let a = h.allocate(40).unwrap();
        let b = h.allocate(40).unwrap();
        assert_eq!(SIZE_CLASSES[class_for(40)], 48);
        assert_eq!(b - a, 48);
        let word: usize = unsafe { (a + 8usize).load() };
        assert_eq!(word, 0);
        assert_eq!(h.used_space(), 96);
    }

    #[test]
    fn interior_pointers_resolve_to_slots() {
        let h = heap();
        let rt = MiniRuntime::new(64);
        let a = h.allocate(64).unwrap();
        unsafe { a.store(fake_vtable()) };
        let found = h.find_object_start(&rt, a + 33usize).unwrap();
        assert_eq!(found.to_raw_address(), a);
        // The neighbouring free slot does not resolve.
        assert!(h.find_object_start(&rt, a + 64usize).is_none());
    }

    #[test]
    fn sweep_reclaims_unmarked() {
        let h = heap();
        let rt = MiniRuntime::new(32);
        let a = h.allocate(32).unwrap();
        let b = h.allocate(32).unwrap();
        unsafe {
            a.store(fake_vtable());
            b.store(fake_vtable());
        }
        let keep = unsafe { ObjectReference::from_raw_address_unchecked(b) };
        object_header::attempt_mark(keep);
        let stats = h.sweep(&rt);
        assert_eq!(stats.live_bytes, 32);
        assert_eq!(stats.swept_bytes, 32);
        assert!(!object_header::is_marked(keep));
        assert_eq!(h.used_space(), 32);
        // The swept slot reads zero and can be handed out again.
        let vt: Address = unsafe { a.load() };
        assert!(vt.is_zero());
        let c = h.allocate(32).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn empty_blocks_are_recycled() {
        let h = heap();
        let rt = MiniRuntime::new(32);
        let a = h.allocate(32).unwrap();
        unsafe { a.store(fake_vtable()) };
        let (_, used_before) = h.section_counts();
        assert_eq!(used_before, 1);
        h.sweep(&rt);
        let (_, used_after) = h.section_counts();
        assert_eq!(used_after, 0);
        assert_eq!(h.used_space(), 0);
    }
}
