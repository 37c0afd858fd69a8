//! Layout constants shared across the collector.

/// log2 of the OS page size we assume. Non-4K kernels are not supported.
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// OS page size in bytes.
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

#[cfg(target_pointer_width = "64")]
pub const LOG_BYTES_IN_WORD: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const LOG_BYTES_IN_WORD: usize = 2;
/// A machine word in bytes.
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// A machine word in bits.
pub const BITS_IN_WORD: usize = BYTES_IN_WORD * 8;

pub const LOG_BYTES_IN_KBYTE: usize = 10;
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;
pub const LOG_BYTES_IN_MBYTE: usize = 20;
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// Minimum object alignment. Forwarding addresses are stored with the low
/// three bits reused as tags, so this may never go below 8.
pub const ALLOC_ALIGN: usize = 8;
pub const LOG_ALLOC_ALIGN: usize = 3;

/// An object is two header words at minimum: vtable word plus forwarding word.
pub const OBJECT_HEADER_WORDS: usize = 2;
pub const MIN_OBJECT_SIZE: usize = OBJECT_HEADER_WORDS * BYTES_IN_WORD;

/// Granularity of the scan-start table: one entry per bucket of this many
/// bytes in an object-walkable section.
pub const SCAN_START_SIZE: usize = 4096;

/// log2 of the card size for the card-table write barrier backend.
pub const CARD_BITS: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_BITS;

/// Requests above this size go to the large-object store.
pub const MAX_SMALL_OBJ_SIZE: usize = 8192;

/// Major-heap block granularity (mark-sweep blocks, copying-space blocks).
pub const MAJOR_BLOCK_SIZE: usize = 16 * 1024;

/// Nursery sizing. The nursery is a single power-of-two section aligned to
/// its own size so the in-nursery check is a mask and compare.
pub const DEFAULT_NURSERY_SIZE: usize = 4 * BYTES_IN_MBYTE;
pub const MIN_NURSERY_SIZE: usize = 256 * BYTES_IN_KBYTE;

/// A nursery gap smaller than this is filled rather than turned into an
/// allocation fragment.
pub const MIN_FRAGMENT_SIZE: usize = 512;

/// Thread-local allocation buffer size carved out of a fragment.
pub const TLAB_SIZE: usize = 4096;

/// Entries in a mutator's sequential store buffer. Exported so a runtime
/// code generator can emit the inline barrier fast path.
pub const STORE_REMSET_BUFFER_SIZE: usize = 1024;

/// Entries per gray-queue section handed between marking workers.
pub const GRAY_SECTION_SIZE: usize = 128;

/// Hard cap on parallel marking workers.
pub const MAX_WORKERS: usize = 16;

/// Heap sizing defaults and floors.
pub const MIN_HEAP_SIZE: usize = 16 * BYTES_IN_MBYTE;
/// Floor for the minor-collection allowance that drives the need-major
/// predicate.
pub const MIN_ALLOWANCE: usize = 4 * DEFAULT_NURSERY_SIZE;
/// Fraction (denominator) of space saved by a major collection granted as
/// the next allowance.
pub const ALLOWANCE_SAVE_RATIO: usize = 3;

/// `wbarrier_arrayref_copy` ranges longer than this take the GC lock around
/// the copy and the barrier pass.
pub const WBARRIER_COPY_LOCK_THRESHOLD: usize = 256;

const_assert!(ALLOC_ALIGN == 1 << LOG_ALLOC_ALIGN);
const_assert!(ALLOC_ALIGN >= 8);
const_assert!(SCAN_START_SIZE.is_power_of_two());
const_assert!(MAJOR_BLOCK_SIZE % BYTES_IN_PAGE == 0);
const_assert!(MAX_SMALL_OBJ_SIZE < MAJOR_BLOCK_SIZE);
