//! Parallel marking coordination.
//!
//! A pool of workers parks between collections. The collection owner pushes
//! jobs into an injector queue and wakes the pool; each worker owns a
//! private tracer and rebalances through the shared section distribute
//! queue. The owner polls and yields while the distribute queue is
//! non-empty, then blocks until every worker has retired from the round:
//! nothing enqueued after `start_marking` is observable as completed until
//! `join` returns.

pub mod work;

pub use work::{execute, HeapCardSource, MarkJob};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam::deque::{Injector, Steal};

use crate::gengc::GenGc;
use crate::plan::tracing::{CollectionKind, Tracer};
use crate::util::gray::SectionDistributeQueue;

struct RoundState {
    epoch: u64,
    kind: CollectionKind,
    finished: usize,
}

pub struct WorkerPool {
    injector: Injector<MarkJob>,
    pub distribute: SectionDistributeQueue,
    /// Workers currently holding work (a job or gray sections).
    working: AtomicUsize,
    round: Mutex<RoundState>,
    cond: Condvar,
    worker_count: usize,
    /// Aggregated tracer counters for the current round.
    promoted_bytes: AtomicUsize,
    work_done: AtomicUsize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        WorkerPool {
            injector: Injector::new(),
            distribute: SectionDistributeQueue::new(),
            working: AtomicUsize::new(0),
            round: Mutex::new(RoundState {
                epoch: 0,
                kind: CollectionKind::Minor,
                finished: 0,
            }),
            cond: Condvar::new(),
            worker_count,
            promoted_bytes: AtomicUsize::new(0),
            work_done: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Spawn the worker threads. Called once, after the collector context
    /// has its final address.
    pub fn spawn(&self, gc: &'static GenGc) {
        for ordinal in 0..self.worker_count {
            gc.rt.spawn_gc_thread(Box::new(move || worker_loop(gc, ordinal)));
        }
        info!("spawned {} marking worker(s)", self.worker_count);
    }

    /// Publish a round of jobs and wake the pool.
    pub fn start_marking(&self, kind: CollectionKind, jobs: Vec<MarkJob>) {
        debug_assert!(self.distribute.is_empty());
        self.promoted_bytes.store(0, Ordering::Relaxed);
        self.work_done.store(0, Ordering::Relaxed);
        for job in jobs {
            self.injector.push(job);
        }
        let mut round = self.round.lock().unwrap();
        round.epoch += 1;
        round.kind = kind;
        round.finished = 0;
        self.cond.notify_all();
    }

    /// Wait for the round to settle. Returns (promoted bytes, shade count)
    /// aggregated over the pool.
    pub fn join(&self) -> (usize, usize) {
        while !self.distribute.is_empty() {
            std::thread::yield_now();
        }
        let mut round = self.round.lock().unwrap();
        while round.finished < self.worker_count {
            round = self.cond.wait(round).unwrap();
        }
        drop(round);
        debug_assert!(self.injector.is_empty() && self.distribute.is_empty());
        (
            self.promoted_bytes.load(Ordering::Relaxed),
            self.work_done.load(Ordering::Relaxed),
        )
    }

    fn quiescent(&self) -> bool {
        self.injector.is_empty()
            && self.distribute.is_empty()
            && self.working.load(Ordering::SeqCst) == 0
    }
}

fn worker_loop(gc: &'static GenGc, ordinal: usize) {
    trace!("marking worker {} up", ordinal);
    let pool = &gc.workers;
    let mut epoch_seen = 0;
    loop {
        let kind = {
            let mut round = pool.round.lock().unwrap();
            while round.epoch == epoch_seen {
                round = pool.cond.wait(round).unwrap();
            }
            epoch_seen = round.epoch;
            round.kind
        };

        let mut tracer = Tracer::with_distribute(gc, kind, &pool.distribute);
        loop {
            let mut got_work = false;
            match pool.injector.steal() {
                Steal::Success(job) => {
                    pool.working.fetch_add(1, Ordering::SeqCst);
                    work::execute(job, gc, &mut tracer);
                    tracer.drain(-1);
                    pool.working.fetch_sub(1, Ordering::SeqCst);
                    got_work = true;
                }
                Steal::Retry => continue,
                Steal::Empty => {}
            }
            if !got_work {
                if let Some(section) = pool.distribute.pop() {
                    pool.working.fetch_add(1, Ordering::SeqCst);
                    tracer.gray.put_section(section);
                    tracer.drain(-1);
                    pool.working.fetch_sub(1, Ordering::SeqCst);
                    got_work = true;
                }
            }
            if !got_work {
                if pool.quiescent() {
                    break;
                }
                std::thread::yield_now();
            }
        }
        debug_assert!(tracer.is_empty());
        pool.promoted_bytes
            .fetch_add(tracer.promoted_bytes, Ordering::Relaxed);
        pool.work_done.fetch_add(tracer.work_done, Ordering::Relaxed);

        let mut round = pool.round.lock().unwrap();
        round.finished += 1;
        if round.finished == pool.worker_count {
            pool.cond.notify_all();
        }
    }
}
