use crate::queue::GlobalQueue;
use crate::runtime::PoolConfig;
use crate::task::Batch;
#[allow(unused_imports)]
use crate::utils::tracker::{Call, Method, Tracker};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub(crate) mod slot;
use slot::{IdleFlags, IdleState, Slot, SlotState};

pub(crate) mod worker;
use worker::{Worker, SWITCH_SHUTDOWN};

/// Options for [`Pool::resume_thread`].
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ResumeOpts {
    /// The caller is the current waking thread, passing the role along.
    pub(crate) was_waking: bool,

    /// Run a newly spawned worker inline on the calling thread instead of
    /// creating an OS thread (entry path: the caller becomes worker 0).
    pub(crate) no_spawn: bool,
}

/// What a worker that found no work should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// A wake request was pending; poll again instead of parking. `waking`
    /// reports whether the caller now holds the waking role.
    Retry { waking: bool },

    /// Parked on the idle stack; block on the event.
    Park,

    /// The pool is shutting down; exit the run loop.
    Shutdown,
}

/// Shared pool header: owns the slot array, the worker records, the global
/// run queue, and the `idle_queue` word tying the wake/park protocol
/// together.
#[derive(Debug)]
pub(crate) struct Pool {
    /// `[ top-slot-index | aba | flags ]`, see [`IdleState`].
    idle_queue: AtomicUsize,

    /// Workers currently out of the idle stack (running or spawning).
    active_threads: AtomicUsize,

    pub(crate) run_queue: GlobalQueue,

    slots: Box<[Slot]>,

    /// One record per slot. Pool-owned so `Associated` pointers read from
    /// slot words stay valid for the pool's lifetime.
    workers: Box<[Worker]>,

    cfg: PoolConfig,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Pool {
    pub(crate) fn new(cfg: PoolConfig) -> Arc<Self> {
        let count = cfg.worker_threads;
        assert!(count >= 1, "pool must have at least one slot");
        assert!(count <= slot::MAX_SLOTS, "pool exceeds the slot index space");

        // Link the slots into a LIFO stack in ascending index order: slot i
        // points at slot i-1 (payload is 1-based, 0 terminates).
        let slots = (0..count)
            .map(|i| Slot::new(SlotState::Free { next: i }))
            .collect();
        let workers = (0..count).map(Worker::new).collect();

        Arc::new(Self {
            idle_queue: AtomicUsize::new(
                IdleState {
                    top: count,
                    aba: 0,
                    flags: IdleFlags::empty(),
                }
                .into(),
            ),
            active_threads: AtomicUsize::new(0),
            run_queue: GlobalQueue::new(),
            slots,
            workers,
            cfg,
            #[cfg(test)]
            tracker: Tracker::new(),
        })
    }

    pub(crate) fn slots(&self) -> &[Slot] {
        &self.slots
    }

    fn idle_state(&self) -> IdleState {
        IdleState::from(self.idle_queue.load(Ordering::Acquire))
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.idle_state().flags.contains(IdleFlags::SHUTDOWN)
    }

    #[inline(always)]
    #[allow(unused_variables)]
    pub(crate) fn track(&self, method: Method, call: impl FnOnce() -> Call) {
        #[cfg(test)]
        self.tracker.record(method, call());
    }

    /// External enqueue: batch goes on the global queue, then a worker is
    /// signalled. Callable from any thread.
    pub(crate) fn push(self: &Arc<Self>, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        self.track(Method::PushGlobal, || Call::PushGlobal { len: batch.len() });
        self.run_queue.push(batch);
        self.resume_thread(ResumeOpts::default());
    }

    /// Wake or spawn one worker for newly available work, enforcing the
    /// single-waker protocol: at most one wake is in flight at a time, and a
    /// request that finds nobody to wake is recorded in `IS_NOTIFIED` for
    /// the next parking worker to consume.
    pub(crate) fn resume_thread(self: &Arc<Self>, opts: ResumeOpts) {
        let mut cur = self.idle_queue.load(Ordering::Acquire);
        loop {
            let state = IdleState::from(cur);
            assert!(
                !state.flags.contains(IdleFlags::SHUTDOWN),
                "resume_thread observed pool shutdown"
            );

            if !opts.was_waking {
                if state.flags.contains(IdleFlags::NOTIFIED) {
                    return;
                }
                if state.flags.contains(IdleFlags::WAKING) {
                    // Another waker is in flight. Record the request so the
                    // waking thread cannot give up the role and park past
                    // our enqueue unnoticed.
                    let new = IdleState {
                        flags: state.flags | IdleFlags::NOTIFIED,
                        ..state
                    };
                    match self.idle_queue.compare_exchange_weak(
                        cur,
                        new.into(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.track(Method::Notify, || Call::Notify);
                            return;
                        }
                        Err(observed) => {
                            cur = observed;
                            continue;
                        }
                    }
                }
            }

            if state.top == 0 {
                // Idle stack is empty: nobody to wake and every slot is
                // spawned, so just record that a wake was requested.
                let mut flags = state.flags | IdleFlags::NOTIFIED;
                if opts.was_waking {
                    flags.remove(IdleFlags::WAKING);
                }
                let new = IdleState { flags, ..state };
                match self.idle_queue.compare_exchange_weak(
                    cur,
                    new.into(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.track(Method::Notify, || Call::Notify);
                        return;
                    }
                    Err(observed) => {
                        cur = observed;
                        continue;
                    }
                }
            }

            let top_index = state.top - 1;
            let (next_top, target) = match self.slots[top_index].load(Ordering::Acquire) {
                SlotState::Free { next } => (next, None),
                SlotState::Associated(worker) => {
                    let next = unsafe { worker.as_ref() }.idle_next.load(Ordering::Relaxed);
                    (next, Some(worker))
                }
                SlotState::Spawning(_) => {
                    // Another waker is mid-publish on this slot; our view of
                    // the stack is stale.
                    cur = self.idle_queue.load(Ordering::Acquire);
                    continue;
                }
                SlotState::Shutdown(_) => unreachable!("retired slot on the idle stack"),
            };

            let new = IdleState {
                top: next_top,
                aba: state.aba,
                flags: state.flags | IdleFlags::WAKING,
            };
            match self.idle_queue.compare_exchange_weak(
                cur,
                new.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Err(observed) => cur = observed,
                Ok(_) => {
                    self.active_threads.fetch_add(1, Ordering::Relaxed);
                    match target {
                        Some(worker) => {
                            self.track(Method::Wake, || Call::Wake {
                                slot: top_index,
                            });
                            let worker = unsafe { worker.as_ref() };
                            // Any non-zero value tells the parked worker
                            // that work, not shutdown, woke it.
                            worker
                                .switch_to
                                .store(Arc::as_ptr(self) as usize, Ordering::Relaxed);
                            worker.event.set();
                        }
                        None => self.spawn_worker(top_index, opts.no_spawn),
                    }
                    return;
                }
            }
        }
    }

    /// A worker found no work: either consume a pending notification and
    /// poll again, or re-announce the worker on the idle stack and tell it
    /// to park. The last worker to park with nothing queued initiates
    /// shutdown, which is how an entry task that can never complete is
    /// detected.
    pub(crate) fn suspend_thread(&self, worker: &Worker, was_waking: bool) -> Suspend {
        let mut cur = self.idle_queue.load(Ordering::Acquire);
        loop {
            let state = IdleState::from(cur);
            if state.flags.contains(IdleFlags::SHUTDOWN) {
                // Exiting from the active side (never parked), so the park
                // path's decrement below will not run for us.
                let prev = self.active_threads.fetch_sub(1, Ordering::AcqRel);
                assert_ne!(prev, 0, "active thread accounting underflow");
                return Suspend::Shutdown;
            }

            if state.flags.contains(IdleFlags::NOTIFIED) {
                // Someone requested a wake while nobody was available; take
                // it instead of parking, and the waking role with it unless
                // another waker holds that.
                let waking = was_waking || !state.flags.contains(IdleFlags::WAKING);
                let mut flags = state.flags - IdleFlags::NOTIFIED;
                if waking {
                    flags |= IdleFlags::WAKING;
                }
                let new = IdleState { flags, ..state };
                match self.idle_queue.compare_exchange_weak(
                    cur,
                    new.into(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Suspend::Retry { waking },
                    Err(observed) => {
                        cur = observed;
                        continue;
                    }
                }
            }

            // Push ourselves: the slot keeps its Associated tag, the stack
            // link rides in the worker record, and the ABA tag bumps.
            worker.idle_next.store(state.top, Ordering::Relaxed);
            let mut flags = state.flags;
            if was_waking {
                flags.remove(IdleFlags::WAKING);
            }
            let new = IdleState {
                top: worker.slot_index + 1,
                aba: state.bump_aba(),
                flags,
            };
            match self.idle_queue.compare_exchange_weak(
                cur,
                new.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Err(observed) => cur = observed,
                Ok(_) => {
                    let prev = self.active_threads.fetch_sub(1, Ordering::AcqRel);
                    assert_ne!(prev, 0, "active thread accounting underflow");
                    if prev == 1 && self.run_queue.is_empty() {
                        // Quiescent with nothing queued: no task can ever
                        // run again, so tear the pool down.
                        self.shutdown();
                    }
                    return Suspend::Park;
                }
            }
        }
    }

    /// Terminal, idempotent: set `IS_SHUTDOWN` and wake every worker still
    /// occupying a slot so it can observe the shutdown and retire.
    pub(crate) fn shutdown(&self) {
        let terminal = IdleState {
            top: 0,
            aba: 0,
            flags: IdleFlags::SHUTDOWN,
        };
        let prev = self.idle_queue.swap(terminal.into(), Ordering::AcqRel);
        if IdleState::from(prev).flags.contains(IdleFlags::SHUTDOWN) {
            return;
        }
        self.track(Method::Shutdown, || Call::Shutdown);

        for slot in self.slots.iter() {
            if let SlotState::Associated(worker) = slot.load(Ordering::Acquire) {
                let worker = unsafe { worker.as_ref() };
                worker.switch_to.store(SWITCH_SHUTDOWN, Ordering::Release);
                worker.event.set();
            }
        }
    }

    /// Claim a `Free` slot for a new worker. OS-thread spawn failure is
    /// absorbed: the slot returns to the idle stack and the pool runs with
    /// fewer workers.
    fn spawn_worker(self: &Arc<Self>, slot_index: usize, no_spawn: bool) {
        self.track(Method::Spawn, || Call::Spawn {
            slot: slot_index,
            inline: no_spawn,
        });
        self.slots[slot_index].store(SlotState::Spawning(ptr::null_mut()), Ordering::Release);

        if no_spawn {
            return self.run_worker(slot_index);
        }

        let mut builder = thread::Builder::new().name(self.cfg.thread_name.name());
        if let Some(stack_size) = self.cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pool = Arc::clone(self);
        let body = move || {
            // A panic unwinding out of the run loop would leave the slot
            // unjoinable and the pool hung; the scheduler state is corrupt
            // at that point, so go down loudly.
            let run = std::panic::AssertUnwindSafe(|| pool.run_worker(slot_index));
            if std::panic::catch_unwind(run).is_err() {
                eprintln!("worker thread panicked, aborting");
                std::process::abort();
            }
        };
        match builder.spawn(body) {
            Ok(handle) => self.publish_handle(slot_index, Box::into_raw(Box::new(handle))),
            Err(_) => self.retire_spawn(slot_index),
        }
    }

    fn publish_handle(&self, slot_index: usize, handle: *mut thread::JoinHandle<()>) {
        match self.slots[slot_index].compare_exchange(
            SlotState::Spawning(ptr::null_mut()),
            SlotState::Spawning(handle),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(()) => {}
            // The worker associated itself first; hand the handle over
            // directly.
            Err(SlotState::Associated(worker)) => {
                unsafe { worker.as_ref() }.handle.store(handle, Ordering::Release);
            }
            // The worker already came and went; nothing will join this
            // handle, so detach the thread.
            Err(SlotState::Shutdown(_)) => drop(unsafe { Box::from_raw(handle) }),
            Err(state) => {
                unreachable!("invalid slot state {state:?} while publishing a thread handle")
            }
        }
    }

    #[cold]
    fn retire_spawn(&self, slot_index: usize) {
        let prev = self.active_threads.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev, 0);

        let mut cur = self.idle_queue.load(Ordering::Acquire);
        loop {
            let state = IdleState::from(cur);
            self.slots[slot_index].store(SlotState::Free { next: state.top }, Ordering::Relaxed);
            // The failed spawn held the waking role; surrender it with the
            // slot.
            let mut flags = state.flags;
            flags.remove(IdleFlags::WAKING);
            let new = IdleState {
                top: slot_index + 1,
                aba: state.bump_aba(),
                flags,
            };
            match self.idle_queue.compare_exchange_weak(
                cur,
                new.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Body of a worker OS thread (or of the caller, for the inline
    /// worker): associate with the slot, run the loop, retire the slot.
    pub(crate) fn run_worker(self: &Arc<Self>, slot_index: usize) {
        let worker = &self.workers[slot_index];

        // SeqCst exchange: the association must be published before the run
        // loop's first queue loads, and those loads must not hoist above it.
        match self.slots[slot_index].swap(
            SlotState::Associated(NonNull::from(worker)),
            Ordering::SeqCst,
        ) {
            SlotState::Spawning(handle) => {
                if !handle.is_null() {
                    worker.handle.store(handle, Ordering::Relaxed);
                }
            }
            state => unreachable!("invalid slot state {state:?} at worker startup"),
        }

        {
            let _ctx = crate::context::enter(Arc::clone(self), worker);
            worker.run(self);
        }

        let handle = worker.handle.swap(ptr::null_mut(), Ordering::Acquire);
        self.slots[slot_index].store(SlotState::Shutdown(handle), Ordering::Release);
    }

    /// Join every spawned worker thread. Runs on the entry thread after its
    /// own run loop exits; slots still mid-retirement are waited out.
    pub(crate) fn join_workers(&self) {
        for slot in self.slots.iter() {
            loop {
                match slot.load(Ordering::Acquire) {
                    SlotState::Free { .. } => break,
                    SlotState::Shutdown(handle) => {
                        if !handle.is_null() {
                            slot.store(SlotState::Shutdown(ptr::null_mut()), Ordering::Relaxed);
                            let _ = unsafe { Box::from_raw(handle) }.join();
                        }
                        break;
                    }
                    SlotState::Associated(_) | SlotState::Spawning(_) => thread::yield_now(),
                }
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        assert_eq!(
            self.active_threads.load(Ordering::Acquire),
            0,
            "pool torn down with active threads"
        );
        assert!(
            self.run_queue.is_empty(),
            "pool torn down with queued tasks"
        );
    }
}
