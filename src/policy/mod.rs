//! Heap policies: the old-generation backends and the large-object store.

pub mod copying;
pub mod largeobjectspace;
pub mod major;
pub mod marksweep;

pub use copying::CopyingHeap;
pub use largeobjectspace::LargeObjectSpace;
pub use major::{MajorCapabilities, MajorHeap, SweepStats};
pub use marksweep::MarkSweepHeap;

use crate::util::heap::HeapBounds;
use crate::util::options::MajorSelector;

/// Instantiate the configured old-generation backend over a reserved range
/// of `reserve_bytes`.
pub fn create_major_heap(
    selector: MajorSelector,
    reserve_bytes: usize,
    bounds: &HeapBounds,
) -> std::io::Result<Box<dyn MajorHeap>> {
    Ok(match selector {
        MajorSelector::MarkSweep => {
            Box::new(MarkSweepHeap::new(reserve_bytes, false, false, bounds)?)
        }
        MajorSelector::MarkSweepPar => {
            Box::new(MarkSweepHeap::new(reserve_bytes, false, true, bounds)?)
        }
        MajorSelector::MarkSweepFixed => {
            Box::new(MarkSweepHeap::new(reserve_bytes, true, false, bounds)?)
        }
        MajorSelector::MarkSweepFixedPar => {
            Box::new(MarkSweepHeap::new(reserve_bytes, true, true, bounds)?)
        }
        MajorSelector::Copying => Box::new(CopyingHeap::new(reserve_bytes, bounds)?),
    })
}
