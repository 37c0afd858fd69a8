//! The interface between the collector and the hosting runtime.
//!
//! The runtime installs one [`Runtime`] trait object at `gc_init`. It is the
//! collector's only window into object layout (sizes, reference bitmaps),
//! thread suspension, stack scanning and finalizer invocation. Everything
//! here must be callable from the collector owner thread during a
//! stop-the-world pause; the thread hooks must also be callable while other
//! threads are running.

mod descriptor;

pub use descriptor::{
    walk_slots, Descriptor, DescriptorKind, UserMarkFn, DESC_TAG_BITS, MAX_BITMAP_SLOTS,
};

use crate::util::{Address, ObjectReference};

/// Identifies a mutator thread to the runtime's suspension machinery.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ThreadId(pub usize);

pub trait Runtime: Sync + Send + 'static {
    // --- object model -----------------------------------------------------

    /// Byte size of an object, including its two header words. Never called
    /// for dead-area fillers.
    fn object_size(&self, object: ObjectReference) -> usize;

    /// Reference bitmap for instances of the class behind `vtable`.
    fn reference_descriptor(&self, vtable: Address) -> Descriptor;

    /// Byte size of an array of `count` elements of the class behind
    /// `vtable`, including headers.
    fn array_byte_size(&self, vtable: Address, count: usize) -> usize;

    /// Element storage of a registered ephemeron array: address of the first
    /// `(key, value)` pair and the pair count. Pairs are two consecutive
    /// words.
    fn ephemeron_pairs(&self, array: ObjectReference) -> (Address, usize);

    /// Whether the class participates in bridge processing.
    fn is_bridge_class(&self, _vtable: Address) -> bool {
        false
    }

    /// Whether the class inherits the critical-finalizer marker class.
    fn has_critical_finalizer(&self, _vtable: Address) -> bool {
        false
    }

    // --- finalization -----------------------------------------------------

    /// Run one finalizer. Called from `run_finalizers` outside the GC lock.
    fn invoke_finalizer(&self, object: ObjectReference);

    /// A collection produced new finalize-ready entries; wake the finalizer
    /// thread.
    fn schedule_finalization(&self) {}

    /// Whether the runtime wants bridge processing this cycle. When true,
    /// the finalizer promotion loop is limited to a single round.
    fn bridge_processing_active(&self) -> bool {
        false
    }

    /// Hand the unreachable bridge objects of this cycle to the runtime's
    /// cycle analysis. Runs in the world-restart post-step.
    fn process_bridge_objects(&self, _objects: &[ObjectReference]) {}

    // --- stop the world ---------------------------------------------------

    /// Ask the runtime to suspend a thread (signal or cooperative). Returns
    /// false if the thread no longer exists.
    fn suspend_thread(&self, thread: ThreadId) -> bool;

    /// Restart a suspended thread. Returns false if the thread no longer
    /// exists.
    fn resume_thread(&self, thread: ThreadId) -> bool;

    /// Block until `count` suspension acknowledgements arrived.
    fn wait_for_suspend_ack(&self, count: usize);

    /// Instruction pointer captured when the thread suspended.
    fn thread_ip(&self, _thread: ThreadId) -> Address {
        Address::zero()
    }

    /// Whether the captured instruction pointer is inside the managed
    /// allocator stub. Such threads are restarted so they can leave the
    /// allocator before the pause settles.
    fn ip_in_managed_allocator(&self, _thread: ThreadId, _ip: Address) -> bool {
        false
    }

    // --- stack scanning ---------------------------------------------------

    /// Report the conservative ranges of a suspended thread (its stack and
    /// register snapshot) through `report`.
    fn thread_conservative_ranges(
        &self,
        thread: ThreadId,
        report: &mut dyn FnMut(Address, Address),
    );

    /// Whether the runtime can precisely enumerate this thread's stack.
    fn supports_precise_stack_scan(&self, _thread: ThreadId) -> bool {
        false
    }

    /// Precisely report each reference slot of the thread's stack through
    /// `relay`. Only called when `supports_precise_stack_scan` is true.
    fn scan_thread_precise(&self, _thread: ThreadId, _relay: &mut dyn FnMut(Address)) {}

    // --- services ---------------------------------------------------------

    /// Spawn a collector-owned thread (marking workers).
    fn spawn_gc_thread(&self, f: Box<dyn FnOnce() + Send>) {
        std::thread::Builder::new()
            .name("gengc-worker".to_string())
            .spawn(f)
            .expect("failed to spawn GC worker thread");
    }

    /// The heap cannot satisfy an allocation even after a forced major
    /// collection. The runtime may abort or raise; if it returns, the
    /// allocation returns null.
    fn out_of_memory(&self, _size: usize) {}
}
