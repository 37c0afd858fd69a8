//! The collector context: one instance per process, owning every piece of
//! global collector state. Components receive it explicitly; the only
//! process-global is the pointer installed by `initialize`, whose tri-state
//! flag makes racing initializers idempotent.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::global_state::GlobalState;
use crate::plan::mutator::ThreadRegistry;
use crate::plan::pinning::PinQueue;
use crate::policy::{create_major_heap, LargeObjectSpace, MajorHeap};
use crate::remset::{CardTable, RememberedSet, SequentialStoreBuffer};
use crate::roots::RootRegistry;
use crate::scheduler::WorkerPool;
use crate::stw::WorldControl;
use crate::util::finalizable_processor::FinalizableProcessor;
use crate::util::heap::nursery::Nursery;
use crate::util::heap::HeapBounds;
use crate::util::options::{DebugFlags, Options, WBarrierSelector};
use crate::util::reference_processor::ReferenceProcessor;
use crate::vm::Runtime;

pub struct GenGc {
    pub(crate) rt: &'static dyn Runtime,
    pub(crate) options: Options,
    pub(crate) debug: DebugFlags,
    pub(crate) bounds: HeapBounds,
    pub(crate) nursery: Nursery,
    pub(crate) major: Box<dyn MajorHeap>,
    pub(crate) los: LargeObjectSpace,
    pub(crate) remset: Box<dyn RememberedSet>,
    pub(crate) roots: RootRegistry,
    pub(crate) pin_queue: PinQueue,
    pub(crate) threads: ThreadRegistry,
    pub(crate) finalizers: Mutex<FinalizableProcessor>,
    pub(crate) references: Mutex<ReferenceProcessor>,
    pub(crate) workers: WorkerPool,
    pub(crate) state: GlobalState,
    pub(crate) world: WorldControl,
    /// Serializes collections and registry mutation.
    pub(crate) gc_lock: Mutex<()>,
}

impl GenGc {
    fn create(rt: &'static dyn Runtime, options: Options, debug: DebugFlags) -> GenGc {
        let bounds = HeapBounds::new();
        let nursery_size = options.nursery_size.0;
        let nursery = Nursery::new(nursery_size)
            .unwrap_or_else(|e| panic!("failed to map a {} byte nursery: {}", nursery_size, e));
        bounds.record_range(nursery.start(), nursery.end());

        let major = create_major_heap(*options.major, options.max_heap_size.0, &bounds)
            .unwrap_or_else(|e| panic!("failed to reserve the old generation: {}", e));
        let caps = major.capabilities();

        let remset: Box<dyn RememberedSet> = match *options.wbarrier {
            WBarrierSelector::Remset => Box::new(SequentialStoreBuffer::new()),
            WBarrierSelector::Cardtable => {
                if !caps.cardtable {
                    eprintln!("gengc: wbarrier=cardtable requires a card-table capable major backend");
                    std::process::exit(1);
                }
                let (start, end) = major.reserved_range();
                Box::new(CardTable::new(start, end - start))
            }
        };

        let worker_count = if caps.parallel { *options.workers } else { 1 };

        info!(
            "gengc up: nursery {}k at {}, major {:?} ({}m reserved), wbarrier {:?}, {} worker(s)",
            nursery_size >> 10,
            nursery.start(),
            *options.major,
            options.max_heap_size.0 >> 20,
            *options.wbarrier,
            worker_count,
        );

        GenGc {
            rt,
            options,
            debug,
            bounds,
            nursery,
            major,
            los: LargeObjectSpace::new(),
            remset,
            roots: RootRegistry::new(),
            pin_queue: PinQueue::new(),
            threads: ThreadRegistry::new(),
            finalizers: Mutex::new(FinalizableProcessor::new()),
            references: Mutex::new(ReferenceProcessor::new()),
            workers: WorkerPool::new(worker_count),
            state: GlobalState::new(),
            world: WorldControl::new(),
            gc_lock: Mutex::new(()),
        }
    }

    /// Whether marking rounds run on the worker pool.
    pub(crate) fn parallel_marking(&self) -> bool {
        self.workers.worker_count() > 1
    }

    pub fn used_size(&self) -> usize {
        let nursery_used = self.nursery.size() - self.nursery.free_bytes();
        nursery_used + self.major.used_space() + self.los.used_space()
    }

    pub fn heap_size(&self) -> usize {
        let (_, used_sections) = self.major.section_counts();
        self.nursery.size()
            + used_sections * crate::util::constants::MAJOR_BLOCK_SIZE
            + self.los.used_space()
    }

    pub fn collection_count(&self, generation: usize) -> usize {
        match generation {
            0 => self.state.minor_collections.load(Ordering::Relaxed),
            _ => self.state.major_collections.load(Ordering::Relaxed),
        }
    }
}

const INIT_UNINITIALIZED: u8 = 0;
const INIT_BUSY: u8 = 1;
const INIT_READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_UNINITIALIZED);
static INSTANCE: AtomicPtr<GenGc> = AtomicPtr::new(std::ptr::null_mut());

/// Bring the collector up. Idempotent under racing callers: exactly one
/// performs the initialization, the others spin until it is ready and get
/// the same instance.
pub fn initialize(rt: &'static dyn Runtime) -> &'static GenGc {
    match INIT_STATE.compare_exchange(
        INIT_UNINITIALIZED,
        INIT_BUSY,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(_) => {
            crate::util::logger::try_init();
            let options = Options::read_from_env();
            let debug = DebugFlags::read_from_env();
            let gc: &'static GenGc = Box::leak(Box::new(GenGc::create(rt, options, debug)));
            INSTANCE.store(gc as *const GenGc as *mut GenGc, Ordering::SeqCst);
            INIT_STATE.store(INIT_READY, Ordering::SeqCst);
            if gc.parallel_marking() {
                gc.workers.spawn(gc);
            }
            gc
        }
        Err(_) => {
            while INIT_STATE.load(Ordering::SeqCst) != INIT_READY {
                std::hint::spin_loop();
            }
            unsafe { &*INSTANCE.load(Ordering::SeqCst) }
        }
    }
}

/// Build an isolated instance for the scenario tests, bypassing the process
/// singleton and the environment.
#[cfg(test)]
pub(crate) fn new_for_tests(
    rt: &'static dyn Runtime,
    params: &str,
    debug_flags: &str,
) -> &'static GenGc {
    let mut options = Options::default();
    assert!(options.apply(params), "bad test params '{}'", params);
    let mut debug = DebugFlags::default();
    debug.apply(debug_flags);
    let gc: &'static GenGc = Box::leak(Box::new(GenGc::create(rt, options, debug)));
    if gc.parallel_marking() {
        gc.workers.spawn(gc);
    }
    gc
}

/// The installed collector instance, if `initialize` ran.
pub fn instance() -> Option<&'static GenGc> {
    if INIT_STATE.load(Ordering::SeqCst) == INIT_READY {
        Some(unsafe { &*INSTANCE.load(Ordering::SeqCst) })
    } else {
        None
    }
}
