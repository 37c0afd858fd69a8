//! Small helpers shared by unit tests. The full synthetic object model used
//! by the end-to-end scenarios lives in `crate::tests`.

use crate::util::{Address, ObjectReference};
use crate::vm::{Descriptor, Runtime, ThreadId};

/// A runtime stub for tests that only need fixed-size, reference-free
/// objects and no thread machinery.
pub struct MiniRuntime {
    pub size: usize,
}

impl MiniRuntime {
    pub fn new(size: usize) -> Self {
        MiniRuntime { size }
    }
}

impl Runtime for MiniRuntime {
    fn object_size(&self, _object: ObjectReference) -> usize {
        self.size
    }

    fn reference_descriptor(&self, _vtable: Address) -> Descriptor {
        Descriptor::EMPTY
    }

    fn array_byte_size(&self, _vtable: Address, _count: usize) -> usize {
        self.size
    }

    fn ephemeron_pairs(&self, _array: ObjectReference) -> (Address, usize) {
        (Address::zero(), 0)
    }

    fn invoke_finalizer(&self, _object: ObjectReference) {}

    fn suspend_thread(&self, _thread: ThreadId) -> bool {
        true
    }

    fn resume_thread(&self, _thread: ThreadId) -> bool {
        true
    }

    fn wait_for_suspend_ack(&self, _count: usize) {}

    fn thread_conservative_ranges(
        &self,
        _thread: ThreadId,
        _report: &mut dyn FnMut(Address, Address),
    ) {
    }
}

/// A distinct vtable-like address for test objects.
pub fn fake_vtable() -> Address {
    static VT: usize = 0;
    Address::from_ref(&VT)
}
