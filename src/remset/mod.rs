//! Remembered sets: the mutator→collector channel for old→young pointers.
//!
//! The collector core depends on two contracts only: `record_pointer` from
//! mutator context, and `finish_scan_remsets` during stop-the-world, which
//! must deliver every recorded slot at least once. The physical
//! representation is one of two backends chosen at init: per-thread
//! sequential store buffers or a card table over the old generation.

mod cardtable;
mod ssb;

pub use cardtable::CardTable;
pub use ssb::SequentialStoreBuffer;

use crate::plan::mutator::{Mutator, ThreadRegistry};
use crate::util::Address;

/// Lets a remset backend turn a dirty address range back into candidate
/// reference slots. Implemented by the collector over the major heap and
/// the large-object store.
pub trait CardSlotSource {
    /// Visit the reference slots of every live object intersecting
    /// `[start, end)`, reporting only slots inside that range.
    fn enumerate_ref_slots(&self, start: Address, end: Address, visit: &mut dyn FnMut(Address));
}

pub trait RememberedSet: Sync + Send {
    /// Mutator-side: `slot` was written and may now hold a nursery pointer.
    fn record_pointer(&self, mutator: &mut Mutator, slot: Address);

    /// Mutator-side: `words` consecutive slots starting at `start` were
    /// written (bulk array stores).
    fn record_range(&self, mutator: &mut Mutator, start: Address, words: usize);

    /// Collector-side recording (e.g. a promoted object still referencing a
    /// pinned nursery survivor). Must be callable from marking workers.
    fn record_global(&self, slot: Address);

    fn begin_scan_remsets(&self);

    /// Deliver every recorded slot at least once. Consumes the log.
    fn finish_scan_remsets(
        &self,
        threads: &ThreadRegistry,
        source: &dyn CardSlotSource,
        visit: &mut dyn FnMut(Address),
    );

    fn prepare_for_minor_collection(&self, threads: &ThreadRegistry);

    /// A major collection rescans the whole heap; the log is stale.
    fn prepare_for_major_collection(&self, threads: &ThreadRegistry);

    fn finish_minor_collection(&self);

    fn register_thread(&self, mutator: &mut Mutator);

    /// A dying thread's recorded slots must survive it.
    fn cleanup_thread(&self, mutator: &mut Mutator);

    fn is_card_table(&self) -> bool {
        false
    }

    /// For runtime code generators: `(table base, covered region base)` of
    /// the card table, when that is the active backend.
    fn card_table_info(&self) -> Option<(Address, Address)> {
        None
    }
}
