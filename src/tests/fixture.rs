//! A synthetic runtime for the end-to-end scenarios: vtable records carrying
//! instance size and reference bitmap, fake thread stacks for conservative
//! scanning, and programmable suspension behavior for the stop-the-world
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::util::constants::*;
use crate::util::{Address, ObjectReference};
use crate::vm::{Descriptor, Runtime, ThreadId};

pub struct TestVtable {
    /// Instance bytes, headers included.
    pub size: usize,
    /// Element bytes for array classes.
    pub elem_size: usize,
    pub descriptor: Descriptor,
    pub critical_finalizer: bool,
    pub bridge: bool,
    /// Pair count for ephemeron array classes.
    pub pair_count: usize,
}

fn vtable_of(object: ObjectReference) -> &'static TestVtable {
    let vt: Address = unsafe { object.to_raw_address().load() };
    unsafe { &*vt.to_ptr::<TestVtable>() }
}

#[derive(Default)]
pub struct TestRuntime {
    /// Fake per-thread stacks handed to the conservative scanner.
    pub stacks: Mutex<HashMap<usize, Vec<usize>>>,
    /// Remaining polls for which a thread reports "inside the managed
    /// allocator".
    pub in_allocator: Mutex<HashMap<usize, usize>>,
    pub suspend_count: Mutex<HashMap<usize, usize>>,
    pub resume_count: Mutex<HashMap<usize, usize>>,
    pub finalized: Mutex<Vec<ObjectReference>>,
    /// When non-zero: a slot each finalized object is also stored into
    /// (resurrection).
    pub resurrect_into: AtomicUsize,
    pub oom_reports: AtomicUsize,
}

impl TestRuntime {
    /// Leak a fixture; the collector keeps a `'static` borrow.
    pub fn leaked() -> &'static TestRuntime {
        Box::leak(Box::new(TestRuntime::default()))
    }

    pub fn set_stack(&self, thread: ThreadId, words: Vec<usize>) {
        self.stacks.lock().unwrap().insert(thread.0, words);
    }

    pub fn park_in_allocator(&self, thread: ThreadId, polls: usize) {
        self.in_allocator.lock().unwrap().insert(thread.0, polls);
    }

    pub fn resumes(&self, thread: ThreadId) -> usize {
        *self.resume_count.lock().unwrap().get(&thread.0).unwrap_or(&0)
    }

    pub fn suspends(&self, thread: ThreadId) -> usize {
        *self
            .suspend_count
            .lock()
            .unwrap()
            .get(&thread.0)
            .unwrap_or(&0)
    }
}

/// Leak a class record and return its vtable address.
pub fn make_class(size: usize, descriptor: Descriptor) -> Address {
    Address::from_ref(Box::leak(Box::new(TestVtable {
        size,
        elem_size: BYTES_IN_WORD,
        descriptor,
        critical_finalizer: false,
        bridge: false,
        pair_count: 0,
    })))
}

/// A class of `size` bytes with no reference slots.
pub fn plain_class(size: usize) -> Address {
    make_class(size, Descriptor::EMPTY)
}

/// A class whose reference slots are given as word indices (headers are
/// words 0 and 1).
pub fn ref_class(size: usize, slots: &[usize]) -> Address {
    let mut bits = 0usize;
    for &slot in slots {
        assert!(slot >= OBJECT_HEADER_WORDS && slot < size / BYTES_IN_WORD);
        bits |= 1 << slot;
    }
    make_class(size, Descriptor::bitmap(bits))
}

/// An ephemeron array class of `pairs` `(key, value)` pairs. The pairs are
/// not strong edges, so the descriptor is empty.
pub fn ephemeron_class(pairs: usize) -> Address {
    Address::from_ref(Box::leak(Box::new(TestVtable {
        size: (OBJECT_HEADER_WORDS + 2 * pairs) * BYTES_IN_WORD,
        elem_size: BYTES_IN_WORD,
        descriptor: Descriptor::EMPTY,
        critical_finalizer: false,
        bridge: false,
        pair_count: pairs,
    })))
}

/// Word index -> slot address within an object.
pub fn slot_of(object: ObjectReference, word: usize) -> Address {
    object.to_raw_address() + word * BYTES_IN_WORD
}

pub fn read_slot(object: ObjectReference, word: usize) -> Option<ObjectReference> {
    unsafe { ObjectReference::load_from_slot(slot_of(object, word)) }
}

impl Runtime for TestRuntime {
    fn object_size(&self, object: ObjectReference) -> usize {
        vtable_of(object).size
    }

    fn reference_descriptor(&self, vtable: Address) -> Descriptor {
        unsafe { &*vtable.to_ptr::<TestVtable>() }.descriptor
    }

    fn array_byte_size(&self, vtable: Address, count: usize) -> usize {
        let vt = unsafe { &*vtable.to_ptr::<TestVtable>() };
        OBJECT_HEADER_WORDS * BYTES_IN_WORD + count * vt.elem_size
    }

    fn ephemeron_pairs(&self, array: ObjectReference) -> (Address, usize) {
        let vt = vtable_of(array);
        (
            array.to_raw_address() + OBJECT_HEADER_WORDS * BYTES_IN_WORD,
            vt.pair_count,
        )
    }

    fn has_critical_finalizer(&self, vtable: Address) -> bool {
        unsafe { &*vtable.to_ptr::<TestVtable>() }.critical_finalizer
    }

    fn is_bridge_class(&self, vtable: Address) -> bool {
        unsafe { &*vtable.to_ptr::<TestVtable>() }.bridge
    }

    fn invoke_finalizer(&self, object: ObjectReference) {
        self.finalized.lock().unwrap().push(object);
        let slot = self.resurrect_into.load(Ordering::SeqCst);
        if slot != 0 {
            unsafe { Address::from_usize(slot).store(object.to_raw_address()) };
        }
    }

    fn suspend_thread(&self, thread: ThreadId) -> bool {
        *self
            .suspend_count
            .lock()
            .unwrap()
            .entry(thread.0)
            .or_insert(0) += 1;
        true
    }

    fn resume_thread(&self, thread: ThreadId) -> bool {
        *self
            .resume_count
            .lock()
            .unwrap()
            .entry(thread.0)
            .or_insert(0) += 1;
        true
    }

    fn wait_for_suspend_ack(&self, _count: usize) {}

    fn ip_in_managed_allocator(&self, thread: ThreadId, _ip: Address) -> bool {
        let mut map = self.in_allocator.lock().unwrap();
        match map.get_mut(&thread.0) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                true
            }
            _ => false,
        }
    }

    fn thread_conservative_ranges(
        &self,
        thread: ThreadId,
        report: &mut dyn FnMut(Address, Address),
    ) {
        let stacks = self.stacks.lock().unwrap();
        if let Some(stack) = stacks.get(&thread.0) {
            if !stack.is_empty() {
                let start = Address::from_ptr(stack.as_ptr());
                report(start, start + stack.len() * BYTES_IN_WORD);
            }
        }
    }

    fn out_of_memory(&self, _size: usize) {
        self.oom_reports.fetch_add(1, Ordering::SeqCst);
    }
}
