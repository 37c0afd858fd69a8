//! Marking jobs.
//!
//! The collection owner enqueues one job per root category; workers (or the
//! owner itself in serial mode) pop jobs and feed the discovered slots into
//! their tracer. Each job exists at most once per collection, so a job body
//! may consume collector-global state (the remset log).

use crate::gengc::GenGc;
use crate::plan::tracing::Tracer;
use crate::remset::CardSlotSource;
use crate::roots::RootKind;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::object_header;
use crate::util::Address;
use crate::util::options::StackMarkSelector;
use crate::vm::{walk_slots, DescriptorKind};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MarkJob {
    ScanRemsets,
    ScanNormalRoots,
    ScanWbarrierRoots,
    ScanThreadData,
    ScanFinalizers,
}

/// Adapter handing the card-table backend the reference slots of objects
/// overlapping a dirty card.
pub struct HeapCardSource<'a> {
    pub gc: &'a GenGc,
}

impl CardSlotSource for HeapCardSource<'_> {
    fn enumerate_ref_slots(&self, start: Address, end: Address, visit: &mut dyn FnMut(Address)) {
        let rt = self.gc.rt;
        self.gc.major.enumerate_objects_in(rt, start, end, &mut |object| {
            let descriptor = rt.reference_descriptor(object_header::vtable(object));
            if descriptor.kind() == DescriptorKind::Bitmap && descriptor.bitmap_bits() == 0 {
                return;
            }
            let words = object_header::object_size(rt, object) / BYTES_IN_WORD;
            walk_slots(descriptor, object.to_raw_address(), words, &mut |slot| {
                if slot >= start && slot < end {
                    visit(slot);
                }
            });
        });
    }
}

pub fn execute(job: MarkJob, gc: &GenGc, tracer: &mut Tracer) {
    trace!("executing {:?}", job);
    match job {
        MarkJob::ScanRemsets => {
            let source = HeapCardSource { gc };
            gc.remset
                .finish_scan_remsets(&gc.threads, &source, &mut |slot| {
                    tracer.trace_slot(slot);
                    tracer.drain(-1);
                });
        }
        MarkJob::ScanNormalRoots => scan_root_table(gc, tracer, RootKind::Normal),
        MarkJob::ScanWbarrierRoots => scan_root_table(gc, tracer, RootKind::WBarrier),
        MarkJob::ScanThreadData => scan_thread_data(gc, tracer),
        MarkJob::ScanFinalizers => {
            gc.finalizers.lock().unwrap().forward_ready(tracer);
        }
    }
}

fn scan_root_table(gc: &GenGc, tracer: &mut Tracer, kind: RootKind) {
    gc.roots.scan_precise(kind, &mut |slot| {
        tracer.trace_slot(slot);
        tracer.drain(-1);
    });
}

/// Precise thread-stack scanning, for threads whose runtime supports it.
/// Conservative threads were already covered by the pinning phase.
fn scan_thread_data(gc: &GenGc, tracer: &mut Tracer) {
    if *gc.options.stack_mark != StackMarkSelector::Precise {
        return;
    }
    let mut threads = vec![];
    unsafe {
        gc.threads.for_each(|m| {
            if !m.skip && gc.rt.supports_precise_stack_scan(m.thread()) {
                threads.push(m.thread());
            }
        });
    }
    for thread in threads {
        gc.rt.scan_thread_precise(thread, &mut |slot| {
            tracer.trace_slot(slot);
        });
        tracer.drain(-1);
    }
}
