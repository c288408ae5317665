//! Futures adapter: turns a `std::future::Future` into a schedulable
//! [`Task`] with a join handle.
//!
//! A spawned future lives in a heap `TaskFuture` carrying the intrusive
//! task node at offset zero; everything else (waking, joining, reference
//! counting) dispatches through a per-type vtable recovered from that node.

use crate::context;
use crate::pool::Pool;
use crate::task::waker::AtomicWaker;
use crate::task::{Batch, Task};
use std::cell::UnsafeCell;
use std::future::Future;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Owned by a worker, currently being polled.
    Running,
    /// Sitting in a run queue (or a switch-to slot).
    Scheduled,
    /// Suspended; a wake must re-schedule it.
    Idle,
    /// Woken while running; the post-poll epilogue re-schedules.
    Notified,
}

/// Decoded task state word: `[ ref_count | completed | status ]`.
#[derive(Debug, Clone, Copy)]
struct State {
    ref_count: usize,
    completed: bool,
    status: Status,
}

impl State {
    const STATUS_MASK: usize = 0b011;
    const COMPLETED: usize = 0b100;
    const REF_COUNT_SHIFT: u32 = 3;
}

impl From<usize> for State {
    fn from(value: usize) -> Self {
        Self {
            ref_count: value >> Self::REF_COUNT_SHIFT,
            completed: value & Self::COMPLETED != 0,
            status: match value & Self::STATUS_MASK {
                0b00 => Status::Running,
                0b01 => Status::Scheduled,
                0b10 => Status::Idle,
                0b11 => Status::Notified,
                _ => unreachable!(),
            },
        }
    }
}

impl From<State> for usize {
    fn from(state: State) -> usize {
        let mut value = state.ref_count << State::REF_COUNT_SHIFT;
        if state.completed {
            value |= State::COMPLETED;
        }
        value
            | match state.status {
                Status::Running => 0b00,
                Status::Scheduled => 0b01,
                Status::Idle => 0b10,
                Status::Notified => 0b11,
            }
    }
}

struct TaskVTable {
    /// `also_drop` folds the waker-consuming `wake` and the borrowing
    /// `wake_by_ref` into one entry point.
    wake_fn: unsafe fn(NonNull<Header>, bool),
    clone_fn: unsafe fn(NonNull<Header>),
    drop_fn: unsafe fn(NonNull<Header>),
    /// `Some((waker, output))` registers interest and, once the future
    /// completed, moves the output out. `None` detaches.
    join_fn: unsafe fn(NonNull<Header>, Option<(&Waker, *mut ())>) -> Poll<()>,
}

/// Type-erased prefix of every `TaskFuture<F>`. `task` sits at offset zero
/// so a task node pointer, a header pointer, and the allocation pointer are
/// all interchangeable.
#[repr(C)]
struct Header {
    task: Task,
    vtable: &'static TaskVTable,
}

enum TaskData<F: Future> {
    Polling(F),
    Ready(F::Output),
    Consumed,
}

#[repr(C)]
struct TaskFuture<F: Future> {
    header: Header,
    state: AtomicUsize,
    join_waker: AtomicWaker,
    pool: Arc<Pool>,
    data: UnsafeCell<TaskData<F>>,
}

impl<F> TaskFuture<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    const VTABLE: TaskVTable = TaskVTable {
        wake_fn: Self::on_wake,
        clone_fn: Self::on_clone,
        drop_fn: Self::on_drop,
        join_fn: Self::on_join,
    };

    /// Allocate the task in `Scheduled` state with two references: the
    /// scheduler's (released when the future completes) and the handle's.
    /// The caller is responsible for enqueueing the returned task node.
    pub(crate) fn allocate(pool: &Arc<Pool>, future: F) -> (JoinHandle<F::Output>, NonNull<Task>) {
        let this = Box::new(TaskFuture {
            header: Header {
                task: Task::new(Self::on_run),
                vtable: &Self::VTABLE,
            },
            state: AtomicUsize::new(
                State {
                    ref_count: 2,
                    completed: false,
                    status: Status::Scheduled,
                }
                .into(),
            ),
            join_waker: AtomicWaker::default(),
            pool: Arc::clone(pool),
            data: UnsafeCell::new(TaskData::Polling(future)),
        });

        // Keep the whole-allocation pointer: header, task node and the
        // allocation itself must stay interchangeable for the vtable casts.
        let this = NonNull::new(Box::into_raw(this)).unwrap();
        let header = this.cast::<Header>();
        let handle = JoinHandle {
            header: Some(header),
            _phantom: PhantomData,
        };
        (handle, header.cast::<Task>())
    }

    unsafe fn from_header<'a>(header: NonNull<Header>) -> &'a Self {
        // repr(C) with the header first makes the casts equivalent.
        unsafe { header.cast::<Self>().as_ref() }
    }

    fn update_state(
        &self,
        mut f: impl FnMut(State) -> Option<State>,
    ) -> Result<State, State> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                f(State::from(value)).map(usize::from)
            })
            .map(State::from)
            .map_err(State::from)
    }

    /// The task node's run callback: poll the future once.
    unsafe fn on_run(task: NonNull<Task>) {
        let header = task.cast::<Header>();
        let this = unsafe { Self::from_header(header) };

        this.update_state(|mut state| {
            assert_ne!(state.ref_count, 0);
            assert!(!state.completed, "polled a completed task");
            state.status = match state.status {
                Status::Scheduled | Status::Notified => Status::Running,
                Status::Running => unreachable!("polled a task that is already running"),
                Status::Idle => unreachable!("polled a task that was not scheduled"),
            };
            Some(state)
        })
        .unwrap();

        match unsafe { this.poll_future(header) } {
            Poll::Ready(output) => unsafe { this.complete(header, output) },
            Poll::Pending => {
                let became_idle = this.update_state(|mut state| {
                    state.status = match state.status {
                        Status::Running => Status::Idle,
                        // A wake landed while we were polling: back on the
                        // queue it goes.
                        Status::Notified => return None,
                        _ => unreachable!("invalid task status after poll"),
                    };
                    Some(state)
                });

                if became_idle.is_err() {
                    this.update_state(|mut state| {
                        state.status = Status::Scheduled;
                        Some(state)
                    })
                    .unwrap();
                    unsafe { Self::schedule(header) };
                }
            }
        }
    }

    unsafe fn poll_future(&self, header: NonNull<Header>) -> Poll<F::Output> {
        // Borrows the scheduler's reference instead of taking one, hence the
        // mem::forget below.
        let raw = RawWaker::new(header.as_ptr() as *const (), &WAKER_VTABLE);
        let waker = unsafe { Waker::from_raw(raw) };
        let mut cx = Context::from_waker(&waker);

        let polled = match unsafe { &mut *self.data.get() } {
            TaskData::Polling(future) => unsafe { Pin::new_unchecked(future) }.poll(&mut cx),
            TaskData::Ready(_) => unreachable!("polled a future that already completed"),
            TaskData::Consumed => unreachable!("polled a future that was already joined"),
        };

        mem::forget(waker);
        polled
    }

    unsafe fn complete(&self, header: NonNull<Header>, output: F::Output) {
        match mem::replace(unsafe { &mut *self.data.get() }, TaskData::Ready(output)) {
            TaskData::Polling(future) => drop(future),
            _ => unreachable!("task completed twice"),
        }

        self.update_state(|mut state| {
            assert!(!state.completed);
            state.completed = true;
            Some(state)
        })
        .unwrap();

        self.join_waker.wake();

        // Release the scheduler's reference.
        unsafe { Self::on_drop(header) };
    }

    /// Re-enqueue a `Scheduled` task: on a worker, its local ring; from a
    /// foreign thread, the pool's global queue.
    unsafe fn schedule(header: NonNull<Header>) {
        let task = header.cast::<Task>();
        let batch = unsafe { Batch::from_task(task) };
        let scheduled = context::with_worker(|pool, worker| worker.schedule(pool, batch));
        if scheduled.is_none() {
            let this = unsafe { Self::from_header(header) };
            let batch = unsafe { Batch::from_task(task) };
            this.pool.push(batch);
        }
    }

    unsafe fn on_wake(header: NonNull<Header>, also_drop: bool) {
        let this = unsafe { Self::from_header(header) };

        let woken = this.update_state(|mut state| {
            assert_ne!(state.ref_count, 0);
            if state.completed {
                return None;
            }
            state.status = match state.status {
                Status::Idle => Status::Scheduled,
                Status::Running => Status::Notified,
                // Already due to run again.
                Status::Scheduled | Status::Notified => return None,
            };
            Some(state)
        });

        if let Ok(state) = woken {
            if state.status == Status::Idle {
                unsafe { Self::schedule(header) };
            }
        }

        if also_drop {
            unsafe { Self::on_drop(header) };
        }
    }

    unsafe fn on_clone(header: NonNull<Header>) {
        let this = unsafe { Self::from_header(header) };
        this.update_state(|mut state| {
            assert_ne!(state.ref_count, 0);
            state.ref_count += 1;
            Some(state)
        })
        .unwrap();
    }

    unsafe fn on_drop(header: NonNull<Header>) {
        let this = unsafe { Self::from_header(header) };
        let state = this
            .update_state(|mut state| {
                assert_ne!(state.ref_count, 0);
                state.ref_count -= 1;
                Some(state)
            })
            .unwrap();

        if state.ref_count == 1 {
            // A task sitting in a run queue is owned by the scheduler; its
            // reference cannot have been the one we just released.
            let state = State::from(this.state.load(Ordering::Acquire));
            assert_ne!(state.status, Status::Scheduled, "freed a queued task");
            drop(unsafe { Box::from_raw(header.cast::<Self>().as_ptr()) });
        }
    }

    unsafe fn on_join(
        header: NonNull<Header>,
        interest: Option<(&Waker, *mut ())>,
    ) -> Poll<()> {
        let this = unsafe { Self::from_header(header) };

        match interest {
            None => {
                // Detaching: drop any registered waker along with the
                // handle's reference.
                let _ = this.join_waker.update(None);
                unsafe { Self::on_drop(header) };
                Poll::Ready(())
            }
            Some((waker, output_ptr)) => {
                if this.join_waker.update(Some(waker)) {
                    return Poll::Pending;
                }

                // The completion wake already fired; the output is ours.
                let state = State::from(this.state.load(Ordering::Acquire));
                assert!(state.completed);
                match mem::replace(unsafe { &mut *this.data.get() }, TaskData::Consumed) {
                    TaskData::Ready(output) => unsafe {
                        (output_ptr as *mut F::Output).write(output)
                    },
                    TaskData::Polling(_) => unreachable!("joined a task that never completed"),
                    TaskData::Consumed => unreachable!("joined a task twice"),
                }

                unsafe { Self::on_drop(header) };
                Poll::Ready(())
            }
        }
    }
}

static WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
    |ptr| unsafe {
        let header = NonNull::new_unchecked(ptr as *mut Header);
        (header.as_ref().vtable.clone_fn)(header);
        RawWaker::new(ptr, &WAKER_VTABLE)
    },
    |ptr| unsafe {
        let header = NonNull::new_unchecked(ptr as *mut Header);
        (header.as_ref().vtable.wake_fn)(header, true)
    },
    |ptr| unsafe {
        let header = NonNull::new_unchecked(ptr as *mut Header);
        (header.as_ref().vtable.wake_fn)(header, false)
    },
    |ptr| unsafe {
        let header = NonNull::new_unchecked(ptr as *mut Header);
        (header.as_ref().vtable.drop_fn)(header)
    },
);

/// Owned handle to a spawned task; a future resolving to the task's output.
/// Dropping it detaches the task, which keeps running to completion.
#[derive(Debug)]
pub struct JoinHandle<T> {
    header: Option<NonNull<Header>>,
    _phantom: PhantomData<T>,
}

// Safety: the handle only touches the task through the vtable's atomically
// guarded entry points.
unsafe impl<T: Send> Send for JoinHandle<T> {}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(header) = self.header.take() {
            unsafe {
                let _ = (header.as_ref().vtable.join_fn)(header, None);
            }
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let header = this.header.expect("join handle polled after completion");

        let mut output = MaybeUninit::<T>::uninit();
        let interest = (cx.waker(), output.as_mut_ptr() as *mut ());
        match unsafe { (header.as_ref().vtable.join_fn)(header, Some(interest)) } {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                this.header = None;
                Poll::Ready(unsafe { output.assume_init() })
            }
        }
    }
}

impl<T> Unpin for JoinHandle<T> {}

/// Spawn a future onto the current thread pool.
///
/// # Panics
///
/// Panics when called from outside a pool worker.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    context::expect_worker(|pool, worker| {
        let (handle, task) = TaskFuture::allocate(pool, future);
        worker.schedule(pool, unsafe { Batch::from_task(task) });
        handle
    })
}

/// Internal entry point for `block_on`: allocate without enqueueing so the
/// caller can push the task before any worker exists.
pub(crate) fn allocate_entry<F>(
    pool: &Arc<Pool>,
    future: F,
) -> (JoinHandle<F::Output>, NonNull<Task>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TaskFuture::allocate(pool, future)
}

/// Move the current task to the back of its worker's run queue and suspend,
/// letting everything already queued there run first.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        // The wake lands while the task is still running, so the post-poll
        // epilogue re-enqueues it at the back of the local ring.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
