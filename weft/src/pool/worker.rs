use crate::park::ParkEvent;
use crate::pool::slot::SlotState;
use crate::pool::{Pool, ResumeOpts, Suspend};
use crate::queue::LocalQueue;
use crate::task::{Batch, Task};
#[allow(unused_imports)]
use crate::utils::tracker::{Call, Method};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// `switch_to` sentinel: the pool is shutting down; a parked worker waking
/// to this value exits instead of polling.
pub(crate) const SWITCH_SHUTDOWN: usize = 0;

/// `switch_to` sentinel: no direct successor is pending.
pub(crate) const SWITCH_EMPTY: usize = 1;

/// How many direct hand-offs may run back-to-back before the pending
/// successor is demoted to the run queue. This is the scheduler's fairness
/// valve: hand-offs keep the cache hot, the budget keeps queued tasks from
/// starving.
const SWITCH_TO_BUDGET: usize = 7;

/// Per-worker record. One per slot, owned by the pool, so sibling pointers
/// read out of `Associated` slot words stay valid for the pool's lifetime.
/// A worker is "live" only between its slot's `Spawning -> Associated`
/// exchange and its `Associated -> Shutdown` store.
#[derive(Debug)]
pub(crate) struct Worker {
    pub(super) slot_index: usize,

    /// Doubles as the directed-successor slot while running (a task address,
    /// or [`SWITCH_EMPTY`]) and as the wake-reason word while parked
    /// ([`SWITCH_SHUTDOWN`], or any non-zero value for "work arrived").
    pub(super) switch_to: AtomicUsize,

    /// Idle-stack link while this worker's slot sits on the stack with an
    /// `Associated` tag (a `Free` slot carries its link in the slot word
    /// itself). Written before the publishing CAS on `idle_queue`.
    pub(super) idle_next: AtomicUsize,

    /// OS join handle, published here by the spawner when the worker won the
    /// `Spawning -> Associated` race; retired into the slot word on exit.
    pub(super) handle: AtomicPtr<thread::JoinHandle<()>>,

    pub(super) event: ParkEvent,

    pub(crate) run_queue: LocalQueue,
}

impl Worker {
    pub(super) fn new(slot_index: usize) -> Self {
        Self {
            slot_index,
            switch_to: AtomicUsize::new(SWITCH_EMPTY),
            idle_next: AtomicUsize::new(0),
            handle: AtomicPtr::new(std::ptr::null_mut()),
            event: ParkEvent::default(),
            run_queue: LocalQueue::default(),
        }
    }

    /// Enqueue a batch on this worker's ring and signal a sibling.
    pub(crate) fn schedule(&self, pool: &Arc<Pool>, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        self.push_local(pool, batch);
        pool.resume_thread(ResumeOpts::default());
    }

    fn push_local(&self, pool: &Arc<Pool>, batch: Batch) {
        pool.track(Method::PushLocal, || Call::PushLocal { len: batch.len() });
        if let Some(overflow) = self.run_queue.push_batch(batch) {
            pool.track(Method::Overflow, || Call::Overflow {
                len: overflow.len(),
            });
            pool.push(overflow);
        }
    }

    /// Record `task` as this worker's directed successor. A previous pending
    /// successor is demoted to a normal local enqueue.
    pub(crate) fn set_switch_to(&self, pool: &Arc<Pool>, task: NonNull<Task>) {
        let prev = self
            .switch_to
            .swap(task.as_ptr() as usize, Ordering::Relaxed);
        if prev != SWITCH_EMPTY && prev != SWITCH_SHUTDOWN {
            let prev = unsafe { NonNull::new_unchecked(prev as *mut Task) };
            self.push_local(pool, unsafe { Batch::from_task(prev) });
        }
    }

    /// The run loop: poll, run with hand-off chaining, park, repeat; exits
    /// on a shutdown wake-up.
    pub(super) fn run(&self, pool: &Arc<Pool>) {
        let seed = Arc::as_ptr(pool) as usize ^ self as *const Self as usize;
        let mut rng = fastrand::Rng::with_seed(seed as u64);

        // A freshly spawned worker holds the waking role.
        let mut is_waking = true;

        loop {
            if let Some((task, polled_global)) = self.poll(pool, &mut rng) {
                if polled_global || is_waking {
                    // Pass the wake signal along before burying ourselves in
                    // task execution.
                    pool.resume_thread(ResumeOpts {
                        was_waking: is_waking,
                        no_spawn: false,
                    });
                    is_waking = false;
                }
                self.run_chain(pool, task);
                continue;
            }

            match pool.suspend_thread(self, is_waking) {
                Suspend::Retry { waking } => is_waking = waking,
                Suspend::Park => {
                    pool.track(Method::Park, || Call::Park {
                        slot: self.slot_index,
                    });
                    self.event.wait();
                    if self.switch_to.load(Ordering::Acquire) == SWITCH_SHUTDOWN {
                        return;
                    }
                    is_waking = true;
                }
                Suspend::Shutdown => return,
            }
        }
    }

    /// Find the next task: own ring, then the global queue (draining a burst
    /// into the ring), then a randomized sweep over sibling rings. The
    /// second tuple field reports whether the task came from the global
    /// queue; `(None, _)` after a held global lock just means someone else
    /// is draining it.
    fn poll(&self, pool: &Arc<Pool>, rng: &mut fastrand::Rng) -> Option<(NonNull<Task>, bool)> {
        if let Some(task) = self.run_queue.pop() {
            return Some((task, false));
        }

        if let Some(mut consumer) = pool.run_queue.try_consume() {
            let task = consumer.pop();
            if task.is_some() {
                self.run_queue.refill(&mut consumer);
            }
            drop(consumer);
            if let Some(task) = task {
                pool.track(Method::PollGlobal, || Call::PollGlobal {
                    slot: self.slot_index,
                });
                return Some((task, true));
            }
        }

        if pool.is_shutting_down() {
            // Siblings may already be retiring their slots; let the suspend
            // path observe the shutdown instead.
            return None;
        }

        let slots = pool.slots();
        let start = rng.usize(..slots.len());
        for index in (0..slots.len()).cycle().skip(start).take(slots.len()) {
            if index == self.slot_index {
                continue;
            }
            match slots[index].load(Ordering::Acquire) {
                SlotState::Associated(sibling) => {
                    // Safety: worker records are pool-owned.
                    let sibling = unsafe { sibling.as_ref() };
                    if let Some(task) = sibling.run_queue.steal_into(&self.run_queue) {
                        pool.track(Method::Steal, || Call::Steal {
                            from: index,
                            count: self.run_queue.len() + 1,
                        });
                        return Some((task, false));
                    }
                }
                SlotState::Free { .. } | SlotState::Spawning(_) => {}
                SlotState::Shutdown(_) => {
                    if pool.is_shutting_down() {
                        return None;
                    }
                    unreachable!("observed a retired slot while stealing");
                }
            }
        }

        None
    }

    /// Run `first`, then keep following directed hand-offs until the budget
    /// runs out or no successor is pending.
    fn run_chain(&self, pool: &Arc<Pool>, first: NonNull<Task>) {
        let mut task = first;
        let mut hops = 0;
        loop {
            self.switch_to.store(SWITCH_EMPTY, Ordering::Relaxed);
            unsafe { Task::run(task) };

            let next = self.switch_to.load(Ordering::Relaxed);
            if next == SWITCH_EMPTY || next == SWITCH_SHUTDOWN {
                return;
            }

            let next = unsafe { NonNull::new_unchecked(next as *mut Task) };
            if hops == SWITCH_TO_BUDGET {
                self.push_local(pool, unsafe { Batch::from_task(next) });
                return;
            }
            hops += 1;
            task = next;
        }
    }
}
