//! gengc is a generational, moving garbage collector for managed-object
//! runtimes. It bump-allocates young objects in a single nursery section,
//! traces live ones from a stop-the-world root set, promotes survivors by
//! copying into a pluggable old generation (mark-sweep or copying), and
//! keeps minor collections cheap with remembered-set write barriers.
//! Conservative references pin objects in place; precise roots and object
//! layouts come from the hosting runtime through one callback trait.
//!
//! The major parts:
//! * [`memory_manager`]: the embedding API (init, allocation, roots,
//!   barriers, finalization, control).
//! * [`vm::Runtime`]: the callbacks the host must supply (object sizes,
//!   reference bitmaps, thread suspension, stack scanning).
//! * [`plan`]: the collection driver, the tracing engine, pinning and the
//!   write barriers.
//! * [`policy`]: the old-generation backends and the large-object store.
//! * [`remset`]: the write-barrier backends (store buffers or card table).
//! * [`scheduler`]: parallel marking workers and their work queues.

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod util;
mod gengc;
mod global_state;
pub mod memory_manager;
pub mod plan;
pub mod policy;
pub mod remset;
pub mod roots;
pub mod scheduler;
pub mod stw;
pub mod vm;

#[cfg(test)]
mod tests;

pub use crate::gengc::GenGc;
pub use crate::plan::Mutator;
pub use crate::roots::RootKind;
pub use crate::util::reference_processor::ToggleRefStatus;
pub use crate::util::{Address, ObjectReference};
pub use crate::vm::{Descriptor, Runtime, ThreadId};
