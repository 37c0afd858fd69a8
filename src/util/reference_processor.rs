//! Weak reference machinery: disappearing links, ephemeron arrays and
//! togglerefs.
//!
//! Disappearing links store their target bit-inverted (hidden) so that
//! conservative stack scans never keep the referent alive by accident. A
//! link is either *non-tracking* (nulled before finalization: the link dies
//! with the object even if a finalizer resurrects it) or *tracking* (nulled
//! only if the object stays dead through finalization, rewritten if it was
//! resurrected or moved).
//!
//! Ephemeron arrays hold `(key, value)` pairs; a value is reachable only
//! while its key is. The pass is iterated to a fixpoint because keeping one
//! value alive can make another array's key reachable.

use std::collections::HashMap;

use crate::plan::tracing::Tracer;
use crate::util::{Address, ObjectReference};
use crate::vm::Runtime;

/// Sentinel stored in the key slot of a cleared ephemeron pair.
pub fn tombstone() -> Address {
    static TOMBSTONE: usize = 0;
    Address::from_ref(&TOMBSTONE)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ToggleRefStatus {
    Drop,
    Strong,
    Weak,
}

pub type ToggleRefCallback = fn(ObjectReference) -> ToggleRefStatus;

#[derive(Copy, Clone)]
struct LinkEntry {
    track: bool,
}

pub struct ReferenceProcessor {
    /// Registered disappearing-link cells, keyed by slot address.
    links: HashMap<Address, LinkEntry>,
    staged_links: Vec<(Address, LinkEntry)>,
    /// Registered ephemeron arrays.
    ephemerons: Vec<ObjectReference>,
    staged_ephemerons: Vec<ObjectReference>,
    togglerefs: Vec<ObjectReference>,
    toggleref_callback: Option<ToggleRefCallback>,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        ReferenceProcessor {
            links: HashMap::new(),
            staged_links: vec![],
            ephemerons: vec![],
            staged_ephemerons: vec![],
            togglerefs: vec![],
            toggleref_callback: None,
        }
    }

    // --- mutator-facing registration --------------------------------------

    /// Register (or retarget) a disappearing link cell. Writes the hidden
    /// pointer into the slot.
    pub fn link_add(
        &mut self,
        slot: Address,
        target: ObjectReference,
        track: bool,
        collection_in_progress: bool,
    ) {
        unsafe { slot.store(target.to_raw_address().hide()) };
        let entry = LinkEntry { track };
        if collection_in_progress {
            self.staged_links.push((slot, entry));
        } else {
            self.links.insert(slot, entry);
        }
    }

    /// Drop a link cell, clearing the slot.
    pub fn link_remove(&mut self, slot: Address) {
        unsafe { slot.store(0usize) };
        self.links.remove(&slot);
        self.staged_links.retain(|(s, _)| *s != slot);
    }

    /// Read a link cell. None when the target died.
    pub fn link_get(&self, slot: Address) -> Option<ObjectReference> {
        let raw: usize = unsafe { slot.load() };
        if raw == 0 {
            return None;
        }
        ObjectReference::from_raw_address(Address::from_usize(raw).reveal())
    }

    pub fn ephemeron_add(&mut self, array: ObjectReference, collection_in_progress: bool) {
        if collection_in_progress {
            self.staged_ephemerons.push(array);
        } else {
            self.ephemerons.push(array);
        }
    }

    pub fn toggleref_add(&mut self, object: ObjectReference) {
        self.togglerefs.push(object);
    }

    pub fn set_toggleref_callback(&mut self, callback: ToggleRefCallback) {
        self.toggleref_callback = Some(callback);
    }

    /// Collection step 4: merge registrations staged during the previous
    /// cycle.
    pub fn merge_staged(&mut self) {
        for (slot, entry) in self.staged_links.drain(..) {
            self.links.insert(slot, entry);
        }
        self.ephemerons.append(&mut self.staged_ephemerons);
    }

    // --- collection passes ------------------------------------------------

    /// Reachability step 2: re-evaluate togglerefs. Strong entries are kept
    /// alive; weak entries are decided by the tracking-link pass at the end
    /// of the cycle; drop entries leave the table.
    pub fn process_togglerefs(&mut self, tracer: &mut Tracer) {
        let Some(callback) = self.toggleref_callback else {
            return;
        };
        let mut kept = vec![];
        for object in std::mem::take(&mut self.togglerefs) {
            match callback(object) {
                ToggleRefStatus::Drop => {}
                ToggleRefStatus::Strong => kept.push(tracer.keep_alive(object)),
                ToggleRefStatus::Weak => kept.push(object),
            }
        }
        self.togglerefs = kept;
        tracer.drain(-1);
    }

    /// End-of-cycle cleanup for weak togglerefs: forward survivors, drop the
    /// dead. Runs with the tracking-link pass.
    pub fn null_weak_togglerefs(&mut self, tracer: &mut Tracer) {
        let mut kept = vec![];
        for object in std::mem::take(&mut self.togglerefs) {
            if tracer.is_live(object) {
                kept.push(tracer.resolve(object));
            }
        }
        self.togglerefs = kept;
    }

    /// One ephemeron round (steps 3 and 7). Returns true if it shaded
    /// anything, in which case the caller runs another round.
    pub fn process_ephemerons(&mut self, rt: &dyn Runtime, tracer: &mut Tracer) -> bool {
        let before = tracer.work_done;
        for idx in 0..self.ephemerons.len() {
            let array = self.ephemerons[idx];
            if !tracer.is_live(array) {
                // Unreachable this round; a later round may revive it.
                continue;
            }
            let array = tracer.resolve(array);
            self.ephemerons[idx] = array;
            let (pairs, count) = rt.ephemeron_pairs(array);
            for pair in 0..count {
                let key_slot = pairs + pair * 2 * crate::util::constants::BYTES_IN_WORD;
                let value_slot = key_slot + crate::util::constants::BYTES_IN_WORD;
                let raw_key: usize = unsafe { key_slot.load() };
                if raw_key == 0 || raw_key == tombstone().as_usize() {
                    continue;
                }
                let key = unsafe {
                    ObjectReference::from_raw_address_unchecked(Address::from_usize(raw_key))
                };
                if !tracer.is_live(key) {
                    continue;
                }
                let key = tracer.resolve(key);
                unsafe { key_slot.store(key.to_raw_address()) };
                tracer.record_old_to_young(key_slot, key);
                // The key is reachable, so the value edge is strong.
                tracer.trace_slot(value_slot);
            }
        }
        tracer.drain(-1);
        tracer.work_done != before
    }

    /// Step 8: clear the pairs whose keys stayed unreachable and drop the
    /// arrays that died. A dead array's vtable may already be gone (domain
    /// teardown); the pairs are simply abandoned with it.
    pub fn clear_unreachable_ephemerons(&mut self, rt: &dyn Runtime, tracer: &mut Tracer) {
        let mut kept = vec![];
        for array in std::mem::take(&mut self.ephemerons) {
            if !tracer.is_live(array) {
                trace!("dropping dead ephemeron array {}", array);
                continue;
            }
            let array = tracer.resolve(array);
            let (pairs, count) = rt.ephemeron_pairs(array);
            for pair in 0..count {
                let key_slot = pairs + pair * 2 * crate::util::constants::BYTES_IN_WORD;
                let value_slot = key_slot + crate::util::constants::BYTES_IN_WORD;
                let raw_key: usize = unsafe { key_slot.load() };
                if raw_key == 0 || raw_key == tombstone().as_usize() {
                    continue;
                }
                let key = unsafe {
                    ObjectReference::from_raw_address_unchecked(Address::from_usize(raw_key))
                };
                if !tracer.is_live(key) {
                    unsafe {
                        key_slot.store(tombstone());
                        value_slot.store(0usize);
                    }
                }
            }
            kept.push(array);
        }
        self.ephemerons = kept;
    }

    /// Null or rewrite disappearing links (steps 5 and 9). `track` selects
    /// which population this pass covers.
    pub fn null_links(&mut self, tracer: &mut Tracer, track: bool) {
        self.links.retain(|&slot, entry| {
            if entry.track != track {
                return true;
            }
            let raw: usize = unsafe { slot.load() };
            if raw == 0 {
                return false;
            }
            let target = unsafe {
                ObjectReference::from_raw_address_unchecked(Address::from_usize(raw).reveal())
            };
            if tracer.is_live(target) {
                let target = tracer.resolve(target);
                unsafe { slot.store(target.to_raw_address().hide()) };
                true
            } else {
                trace!("nulling {} link at {}", if track { "tracking" } else { "non-tracking" }, slot);
                unsafe { slot.store(0usize) };
                false
            }
        });
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn ephemeron_count(&self) -> usize {
        self.ephemerons.len()
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_cells_hide_their_target() {
        let mut rp = ReferenceProcessor::new();
        let cell: usize = 0;
        let slot = Address::from_ref(&cell);
        let target =
            unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(0x7000)) };
        rp.link_add(slot, target, false, false);
        // The raw cell does not contain the pointer.
        let raw: usize = unsafe { slot.load() };
        assert_ne!(raw, 0x7000);
        assert_eq!(rp.link_get(slot), Some(target));
        rp.link_remove(slot);
        assert_eq!(rp.link_get(slot), None);
        assert_eq!(rp.link_count(), 0);
    }

    #[test]
    fn staged_registrations_wait_for_merge() {
        let mut rp = ReferenceProcessor::new();
        let cell: usize = 0;
        let slot = Address::from_ref(&cell);
        let target =
            unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(0x7000)) };
        rp.link_add(slot, target, true, true);
        assert_eq!(rp.link_count(), 0);
        // The hidden store is visible immediately even while staged.
        assert_eq!(rp.link_get(slot), Some(target));
        rp.merge_staged();
        assert_eq!(rp.link_count(), 1);
    }
}
