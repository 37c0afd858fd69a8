//! Finalization.
//!
//! Objects registered for finalization sit in `registered` until a
//! collection finds them unreachable; they are then promoted (kept alive)
//! and moved to a fin-ready list, ordinary or critical depending on the
//! class. The finalizer thread drains the ready lists outside
//! stop-the-world: entries are detached under the GC lock before the
//! callback fires, so each registration yields at most one invocation.
//!
//! Registrations arriving while a collection is running are staged and
//! merged at the start of the next collection.

use std::collections::VecDeque;

use crate::plan::tracing::Tracer;
use crate::util::object_header;
use crate::util::ObjectReference;
use crate::vm::Runtime;

#[derive(Default)]
pub struct FinalizableProcessor {
    /// Candidates: registered objects whose finalizer has not run.
    registered: Vec<ObjectReference>,
    /// Dead candidates kept alive until their finalizer runs.
    ready: VecDeque<ObjectReference>,
    /// Same, for classes inheriting the critical-finalizer marker; drained
    /// only after every ordinary entry.
    ready_critical: VecDeque<ObjectReference>,
    /// Registrations deferred from mutator time during a collection.
    staged: Vec<ObjectReference>,
}

impl FinalizableProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: ObjectReference, collection_in_progress: bool) {
        if collection_in_progress {
            self.staged.push(object);
        } else {
            self.registered.push(object);
        }
    }

    /// Collection step 4: merge deferred registrations.
    pub fn merge_staged(&mut self) {
        self.registered.append(&mut self.staged);
    }

    /// Keep the not-yet-finalized ready entries alive and current. Runs as
    /// a root job: these objects are live by construction.
    pub fn forward_ready(&mut self, tracer: &mut Tracer) {
        for entry in self.ready.iter_mut().chain(self.ready_critical.iter_mut()) {
            *entry = tracer.keep_alive(*entry);
        }
        tracer.drain(-1);
    }

    /// One round of the finalizer promotion loop: move every unreachable
    /// candidate to fin-ready (promoting it), fix up the addresses of the
    /// survivors. When bridge processing is active, unreachable candidates
    /// of bridge classes go to `bridge_out` instead and stay registered.
    /// Returns the number of entries that became ready.
    pub fn scan_for_finalization(
        &mut self,
        rt: &dyn Runtime,
        tracer: &mut Tracer,
        bridge_active: bool,
        bridge_out: &mut Vec<ObjectReference>,
    ) -> usize {
        let mut newly_ready = 0;
        let mut remaining = Vec::with_capacity(self.registered.len());
        for object in std::mem::take(&mut self.registered) {
            if tracer.is_live(object) {
                remaining.push(tracer.resolve(object));
                continue;
            }
            let kept = tracer.keep_alive(object);
            let vtable = object_header::vtable(kept);
            if bridge_active && rt.is_bridge_class(vtable) {
                bridge_out.push(kept);
                remaining.push(kept);
                continue;
            }
            trace!("{} became finalize-ready", kept);
            if rt.has_critical_finalizer(vtable) {
                self.ready_critical.push_back(kept);
            } else {
                self.ready.push_back(kept);
            }
            newly_ready += 1;
        }
        self.registered = remaining;
        tracer.drain(-1);
        newly_ready
    }

    /// Bridge gathering (reachability step 4): promote every unreachable
    /// bridge-class candidate and report it for the runtime's cycle
    /// analysis. The entries stay registered; being live now, the promotion
    /// loop will skip them this cycle.
    pub fn collect_bridge_objects(
        &mut self,
        rt: &dyn Runtime,
        tracer: &mut Tracer,
        out: &mut Vec<ObjectReference>,
    ) {
        for entry in self.registered.iter_mut() {
            if tracer.is_live(*entry) {
                *entry = tracer.resolve(*entry);
                continue;
            }
            if rt.is_bridge_class(object_header::vtable(*entry)) {
                *entry = tracer.keep_alive(*entry);
                out.push(*entry);
            }
        }
        tracer.drain(-1);
    }

    /// Detach one fin-ready entry: ordinary entries first, critical entries
    /// only once the ordinary list is empty.
    pub fn pop_ready(&mut self) -> Option<ObjectReference> {
        self.ready
            .pop_front()
            .or_else(|| self.ready_critical.pop_front())
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty() || !self.ready_critical.is_empty()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len() + self.ready_critical.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn obj(i: usize) -> ObjectReference {
        unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(i * 16)) }
    }

    #[test]
    fn staging_defers_until_merge() {
        let mut f = FinalizableProcessor::new();
        f.add(obj(1), false);
        f.add(obj(2), true);
        assert_eq!(f.registered_count(), 1);
        f.merge_staged();
        assert_eq!(f.registered_count(), 2);
    }

    #[test]
    fn ready_drains_ordinary_before_critical() {
        let mut f = FinalizableProcessor::new();
        f.ready_critical.push_back(obj(9));
        f.ready.push_back(obj(1));
        f.ready.push_back(obj(2));
        assert_eq!(f.pop_ready(), Some(obj(1)));
        assert_eq!(f.pop_ready(), Some(obj(2)));
        assert_eq!(f.pop_ready(), Some(obj(9)));
        assert_eq!(f.pop_ready(), None);
        assert!(!f.has_ready());
    }
}
