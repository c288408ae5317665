use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

// Public API
pub mod future;
pub use future::JoinHandle;

pub(crate) mod waker;

/// Callback resuming the continuation a [`Task`] stands for. Receives the
/// task's own address so intrusive holders can recover their enclosing
/// allocation.
pub type RunFn = unsafe fn(NonNull<Task>);

/// An intrusively-linked, externally-owned continuation.
///
/// The scheduler never allocates or frees a `Task`; it borrows the value for
/// exactly as long as the task sits in one of its queues or is being run.
/// The `next` link belongs to whichever queue currently holds the task, so a
/// task may be a member of at most one queue at a time.
///
/// The alignment guarantees two free low bits in any `*mut Task`, used by
/// the global run queue to pack its consumer lock into a pointer word.
#[repr(align(4))]
#[derive(Debug)]
pub struct Task {
    next: AtomicPtr<Task>,
    run_fn: RunFn,
}

impl Task {
    pub const fn new(run_fn: RunFn) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            run_fn,
        }
    }

    /// Resume the continuation. The pointer must reference a live task that
    /// is owned by the calling worker and linked into no queue.
    pub(crate) unsafe fn run(task: NonNull<Task>) {
        let run_fn = unsafe { task.as_ref().run_fn };
        unsafe { run_fn(task) }
    }

    pub(crate) fn set_next(&self, next: *mut Task) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn get_next(&self) -> *mut Task {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn next_atomic(&self) -> &AtomicPtr<Task> {
        &self.next
    }

    /// Enqueue this task at the back of the calling worker's local run
    /// queue. The task resumes after everything already queued locally, so a
    /// continuation invoking this right before suspending yields the worker
    /// to its siblings.
    ///
    /// # Panics
    ///
    /// Panics when called from outside the thread pool.
    ///
    /// # Safety
    ///
    /// The task must stay live and untouched until the scheduler runs it.
    pub unsafe fn schedule(task: NonNull<Task>) {
        unsafe { Batch::from_task(task).schedule() }
    }

    /// Request a direct hand-off: the calling worker runs `task` next,
    /// bypassing every queue, as soon as the current continuation returns
    /// or suspends. A second request before that point demotes the earlier
    /// target to a normal local enqueue.
    ///
    /// # Panics
    ///
    /// Panics when called from outside the thread pool.
    ///
    /// # Safety
    ///
    /// Same liveness contract as [`Task::schedule`].
    pub unsafe fn schedule_next(task: NonNull<Task>) {
        crate::context::expect_worker(|pool, worker| worker.set_switch_to(pool, task));
    }
}

/// An owning, singly-linked list of tasks moved around as a unit.
///
/// `head.is_none()` exactly when `len == 0`; when non-empty, `tail` is
/// reachable from `head` in `len - 1` hops and `tail`'s link is null.
#[derive(Debug, Default)]
pub struct Batch {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
    len: usize,
}

// Safety: a batch owns the tasks linked through it; sending the batch
// transfers that ownership wholesale.
unsafe impl Send for Batch {}

impl Batch {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// # Safety
    ///
    /// The caller hands over ownership of `task` until it is popped or run.
    pub unsafe fn from_task(task: NonNull<Task>) -> Self {
        unsafe { task.as_ref().set_next(ptr::null_mut()) };
        Self {
            head: Some(task),
            tail: Some(task),
            len: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.head.is_none(), self.len == 0);
        self.head.is_none()
    }

    /// # Safety
    ///
    /// Same ownership hand-over as [`Batch::from_task`].
    pub unsafe fn push_front(&mut self, task: NonNull<Task>) {
        unsafe { self.push_front_batch(Self::from_task(task)) }
    }

    /// # Safety
    ///
    /// Same ownership hand-over as [`Batch::from_task`].
    pub unsafe fn push_back(&mut self, task: NonNull<Task>) {
        unsafe { self.push_back_batch(Self::from_task(task)) }
    }

    pub fn push_front_batch(&mut self, other: Batch) {
        if other.is_empty() {
            return;
        }
        match self.head {
            None => *self = other,
            Some(head) => {
                unsafe { other.tail.unwrap().as_ref().set_next(head.as_ptr()) };
                self.head = other.head;
                self.len += other.len;
            }
        }
    }

    pub fn push_back_batch(&mut self, other: Batch) {
        if other.is_empty() {
            return;
        }
        match self.tail {
            None => *self = other,
            Some(tail) => {
                unsafe { tail.as_ref().set_next(other.head.unwrap().as_ptr()) };
                self.tail = other.tail;
                self.len += other.len;
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<NonNull<Task>> {
        let task = self.head?;
        self.head = NonNull::new(unsafe { task.as_ref().get_next() });
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        debug_assert_eq!(self.head.is_none(), self.len == 0);
        Some(task)
    }

    /// Hand the whole batch to the calling worker's local run queue.
    ///
    /// # Panics
    ///
    /// Panics when called from outside the thread pool; external producers
    /// must enqueue through the pool handle instead.
    pub fn schedule(self) {
        crate::context::expect_worker(|pool, worker| worker.schedule(pool, self));
    }

    /// Detach the list as raw `(head, tail)` pointers, consuming the batch.
    pub(crate) fn into_raw(self) -> Option<(NonNull<Task>, NonNull<Task>)> {
        Some((self.head?, self.tail?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::NoopTask;
    use static_assertions::const_assert;

    // The global queue packs its consumer lock into a task pointer's low bit.
    const_assert!(std::mem::align_of::<Task>() >= 4);

    #[test]
    fn batch_from_task_round_trips() {
        let t = NoopTask::new();
        let mut batch = unsafe { Batch::from_task(t.as_task()) };

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.pop_front(), Some(t.as_task()));
        assert!(batch.is_empty());
        assert_eq!(batch.pop_front(), None);
    }

    #[test]
    fn push_back_preserves_fifo_order() {
        let tasks: Vec<NoopTask> = (0..8).map(|_| NoopTask::new()).collect();
        let mut batch = Batch::new();
        for t in &tasks {
            unsafe { batch.push_back(t.as_task()) };
        }

        assert_eq!(batch.len(), tasks.len());
        for t in &tasks {
            assert_eq!(batch.pop_front(), Some(t.as_task()));
        }
        assert!(batch.is_empty());
    }

    #[test]
    fn push_front_prepends() {
        let a = NoopTask::new();
        let b = NoopTask::new();

        let mut batch = unsafe { Batch::from_task(a.as_task()) };
        unsafe { batch.push_front(b.as_task()) };

        assert_eq!(batch.pop_front(), Some(b.as_task()));
        assert_eq!(batch.pop_front(), Some(a.as_task()));
    }

    #[test]
    fn concatenated_batches_drain_in_order() {
        let first: Vec<NoopTask> = (0..4).map(|_| NoopTask::new()).collect();
        let second: Vec<NoopTask> = (0..4).map(|_| NoopTask::new()).collect();

        let mut b1 = Batch::new();
        for t in &first {
            unsafe { b1.push_back(t.as_task()) };
        }
        let mut b2 = Batch::new();
        for t in &second {
            unsafe { b2.push_back(t.as_task()) };
        }

        let mut all = Batch::new();
        all.push_back_batch(b1);
        all.push_back_batch(b2);

        assert_eq!(all.len(), first.len() + second.len());
        for t in first.iter().chain(second.iter()) {
            assert_eq!(all.pop_front(), Some(t.as_task()));
        }
    }

    #[test]
    fn empty_batch_concat_is_noop() {
        let t = NoopTask::new();
        let mut batch = unsafe { Batch::from_task(t.as_task()) };

        batch.push_back_batch(Batch::new());
        batch.push_front_batch(Batch::new());

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.pop_front(), Some(t.as_task()));
    }

    #[test]
    #[should_panic(expected = "outside the thread pool")]
    fn schedule_outside_pool_panics() {
        let t = NoopTask::new();
        let batch = unsafe { Batch::from_task(t.as_task()) };
        batch.schedule();
    }
}
