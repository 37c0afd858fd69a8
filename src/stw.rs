//! The stop-the-world protocol.
//!
//! Entry assumes the initiating thread holds the GC lock. The interruption
//! lock (blocking mutator APIs that cannot run during a pause) and the
//! suspend lock (serializing signal-based suspension) are both held across
//! the pause and released by `restart_world`.
//!
//! Suspension is asymmetric: the runtime signals each registered thread and
//! we wait for acknowledgements. A thread that was caught inside the
//! managed allocator is restarted so it can leave (its allocation is not
//! atomic against collector state) and is re-suspended in the next round;
//! the handshake repeats until no live thread is in the allocator. Threads
//! that fail to acknowledge are dead: they are marked `skip` and ignored by
//! every later pass.

use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use crate::gengc::GenGc;
use crate::vm::ThreadId;

pub struct WorldControl {
    pub(crate) interruption_lock: std::sync::Mutex<()>,
    pub(crate) suspend_lock: std::sync::Mutex<()>,
}

impl WorldControl {
    pub fn new() -> Self {
        WorldControl {
            interruption_lock: std::sync::Mutex::new(()),
            suspend_lock: std::sync::Mutex::new(()),
        }
    }
}

impl Default for WorldControl {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StoppedWorld<'a> {
    _interruption: MutexGuard<'a, ()>,
    _suspend: MutexGuard<'a, ()>,
    /// Threads we actually suspended (initiator and skipped threads absent).
    pub stopped: Vec<ThreadId>,
    /// Handshake rounds it took to settle.
    pub rounds: usize,
    started_at: Instant,
}

fn mark_skip(gc: &GenGc, thread: ThreadId) {
    debug!("thread {:?} disappeared during handshake; skipping", thread);
    unsafe {
        gc.threads.for_each(|m| {
            if m.thread() == thread {
                m.skip = true;
            }
        });
    }
}

/// Suspend every registered mutator except the initiator. Returns with all
/// live threads stopped outside the managed allocator.
pub fn stop_world(gc: &GenGc, initiator: Option<ThreadId>) -> StoppedWorld<'_> {
    let interruption = gc.world.interruption_lock.lock().unwrap();
    let suspend = gc.world.suspend_lock.lock().unwrap();
    let started_at = Instant::now();

    let mut stopped: Vec<ThreadId> = vec![];
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut signaled = vec![];
        unsafe {
            gc.threads.for_each(|m| {
                let thread = m.thread();
                if Some(thread) == initiator || m.skip || stopped.contains(&thread) {
                    return;
                }
                if gc.rt.suspend_thread(thread) {
                    signaled.push(thread);
                } else {
                    m.skip = true;
                }
            });
        }
        gc.rt.wait_for_suspend_ack(signaled.len());
        stopped.extend(signaled);

        // Threads parked inside the managed allocator get another run.
        let mut restarted = vec![];
        stopped.retain(|&thread| {
            let ip = gc.rt.thread_ip(thread);
            if gc.rt.ip_in_managed_allocator(thread, ip) {
                restarted.push(thread);
                false
            } else {
                true
            }
        });
        if restarted.is_empty() {
            break;
        }
        for &thread in &restarted {
            if !gc.rt.resume_thread(thread) {
                mark_skip(gc, thread);
            }
        }
        if rounds % 100 == 0 {
            warn!(
                "stop-the-world still waiting on {} thread(s) in the allocator after {} rounds",
                restarted.len(),
                rounds
            );
        }
        std::thread::yield_now();
    }

    debug!(
        "world stopped: {} thread(s) in {} round(s)",
        stopped.len(),
        rounds
    );
    StoppedWorld {
        _interruption: interruption,
        _suspend: suspend,
        stopped,
        rounds,
        started_at,
    }
}

/// Resume every suspended thread and release the pause locks. Returns the
/// pause duration, measured stop→restart.
pub fn restart_world(gc: &GenGc, stopped: StoppedWorld<'_>) -> Duration {
    for &thread in &stopped.stopped {
        if !gc.rt.resume_thread(thread) {
            mark_skip(gc, thread);
        }
    }
    let pause = stopped.started_at.elapsed();
    debug!("world restarted after {:?}", pause);
    pause
}
