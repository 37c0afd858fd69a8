//! Gray queues: work lists of discovered-but-unscanned objects.
//!
//! A queue is a stack of fixed-size sections so that parallel marking can
//! hand whole sections between workers through the shared
//! [`SectionDistributeQueue`]. Gray queues only grow and shrink during
//! stop-the-world.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::util::constants::GRAY_SECTION_SIZE;
use crate::util::ObjectReference;

pub type GraySection = Vec<ObjectReference>;

pub struct GrayQueue {
    /// The section being pushed/popped.
    active: GraySection,
    /// Full sections, oldest first.
    full: Vec<GraySection>,
}

impl GrayQueue {
    pub fn new() -> Self {
        GrayQueue {
            active: Vec::with_capacity(GRAY_SECTION_SIZE),
            full: vec![],
        }
    }

    pub fn enqueue(&mut self, object: ObjectReference) {
        if self.active.len() == GRAY_SECTION_SIZE {
            let filled = std::mem::replace(&mut self.active, Vec::with_capacity(GRAY_SECTION_SIZE));
            self.full.push(filled);
        }
        self.active.push(object);
    }

    pub fn dequeue(&mut self) -> Option<ObjectReference> {
        if let Some(object) = self.active.pop() {
            return Some(object);
        }
        match self.full.pop() {
            Some(section) => {
                self.active = section;
                self.active.pop()
            }
            None => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.full.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.full.len() * GRAY_SECTION_SIZE
    }

    /// Number of full sections available for redistribution.
    pub fn spare_sections(&self) -> usize {
        self.full.len()
    }

    /// Detach one full section for another worker.
    pub fn take_section(&mut self) -> Option<GraySection> {
        self.full.pop()
    }

    pub fn put_section(&mut self, section: GraySection) {
        debug_assert!(!section.is_empty());
        self.full.push(section);
    }

    /// Drain every entry into another queue. Used when a worker retires.
    pub fn drain_into(&mut self, other: &mut GrayQueue) {
        while let Some(object) = self.dequeue() {
            other.enqueue(object);
        }
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock-protected section list idle workers pull from. The section count
/// is mirrored in an atomic so the owner thread can poll emptiness without
/// taking the lock.
pub struct SectionDistributeQueue {
    sections: Mutex<Vec<GraySection>>,
    count: AtomicUsize,
}

impl SectionDistributeQueue {
    pub fn new() -> Self {
        SectionDistributeQueue {
            sections: Mutex::new(vec![]),
            count: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, section: GraySection) {
        debug_assert!(!section.is_empty());
        let mut sections = self.sections.lock().unwrap();
        sections.push(section);
        self.count.store(sections.len(), Ordering::Release);
    }

    pub fn pop(&self) -> Option<GraySection> {
        let mut sections = self.sections.lock().unwrap();
        let section = sections.pop();
        self.count.store(sections.len(), Ordering::Release);
        section
    }

    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }
}

impl Default for SectionDistributeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn obj(i: usize) -> ObjectReference {
        unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(i * 8)) }
    }

    #[test]
    fn lifo_within_section() {
        let mut q = GrayQueue::new();
        q.enqueue(obj(1));
        q.enqueue(obj(2));
        assert_eq!(q.dequeue(), Some(obj(2)));
        assert_eq!(q.dequeue(), Some(obj(1)));
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn spills_into_sections() {
        let mut q = GrayQueue::new();
        for i in 1..=(GRAY_SECTION_SIZE * 2 + 10) {
            q.enqueue(obj(i));
        }
        assert_eq!(q.spare_sections(), 2);
        let section = q.take_section().unwrap();
        assert_eq!(section.len(), GRAY_SECTION_SIZE);
        let mut drained = 0;
        while q.dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, GRAY_SECTION_SIZE + 10);
    }

    #[test]
    fn distribute_queue_counts() {
        let d = SectionDistributeQueue::new();
        assert!(d.is_empty());
        d.push(vec![obj(1)]);
        assert!(!d.is_empty());
        assert_eq!(d.pop().unwrap(), vec![obj(1)]);
        assert!(d.is_empty());
    }
}
