use crate::pool::slot::IdleFlags;
use crate::task::{Batch, Task};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Intrusive wait-free MPSC run queue shared by all workers and external
/// producers (Vyukov scheme, anchored by an embedded stub node).
///
/// Producers exchange `head` and then link the previous head to the new
/// sublist; the window between those two steps is the only non-wait-free
/// aspect, and the consumer reports it as "empty, retry later".
///
/// The consumer side is serialized by a 1-bit spinlock packed into the low
/// bit of `tail`: whoever CASes the bit in owns dequeueing until the
/// [`Consumer`] guard drops, which republishes the cursor and clears the bit
/// in a single release store.
#[derive(Debug)]
pub(crate) struct GlobalQueue {
    /// Producer end: the most recently enqueued task (or the stub).
    head: AtomicPtr<Task>,

    /// Consumer cursor tagged with [`IdleFlags::POLLING`] in its low bit.
    tail: AtomicUsize,

    stub: Task,
}

// The stub must never reach a worker.
fn stub_run(_: NonNull<Task>) {
    unreachable!("global queue stub task executed");
}

impl GlobalQueue {
    const POLLING: usize = IdleFlags::POLLING.bits();

    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicUsize::new(0),
            stub: Task::new(stub_run),
        }
    }

    fn stub_ptr(&self) -> *mut Task {
        &self.stub as *const Task as *mut Task
    }

    /// Lazily anchor `head`/`tail` at the stub. `new()` cannot do it because
    /// the queue moves into place (inside the pool) after construction.
    fn init(&self) -> *mut Task {
        let stub = self.stub_ptr();
        let _ = self
            .head
            .compare_exchange(ptr::null_mut(), stub, Ordering::AcqRel, Ordering::Acquire);
        let _ = self
            .tail
            .compare_exchange(0, stub as usize, Ordering::AcqRel, Ordering::Acquire);
        stub
    }

    /// Append a batch. Callable from any thread; never blocks.
    pub(crate) fn push(&self, batch: Batch) {
        let Some((first, last)) = batch.into_raw() else {
            return;
        };
        self.init();
        unsafe { last.as_ref().set_next(ptr::null_mut()) };

        let prev = self.head.swap(last.as_ptr(), Ordering::AcqRel);
        // Producers are serialized by the swap above; linking the previous
        // head publishes the whole sublist to the consumer.
        unsafe { (*prev).next_atomic().store(first.as_ptr(), Ordering::Release) };
    }

    /// Acquire the consumer lock, or `None` if another worker is draining.
    pub(crate) fn try_consume(&self) -> Option<Consumer<'_>> {
        let stub = self.init();
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            if tail & Self::POLLING != 0 {
                return None;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail | Self::POLLING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let cursor = (tail & !Self::POLLING) as *mut Task;
                    debug_assert!(!cursor.is_null());
                    let _ = stub;
                    return Some(Consumer {
                        queue: self,
                        cursor,
                    });
                }
                Err(observed) => tail = observed,
            }
        }
    }

    /// Whether the queue looks drained. Only meaningful when no consumer can
    /// be active (the last parking worker checks this with every sibling
    /// already parked); a racing producer is reported as non-empty as soon
    /// as its `head` exchange lands.
    pub(crate) fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return true;
        }
        let cursor = (self.tail.load(Ordering::Acquire) & !Self::POLLING) as *mut Task;
        if cursor.is_null() {
            // A producer is mid-way through anchoring the queue.
            return false;
        }
        let next = unsafe { (*cursor).next_atomic().load(Ordering::Acquire) };
        next.is_null() && head == cursor
    }
}

// Safety: the queue hands each linked task to exactly one consumer; the
// stub never escapes.
unsafe impl Send for GlobalQueue {}
unsafe impl Sync for GlobalQueue {}

/// Exclusive dequeue handle. Dropping it releases the consumer lock on every
/// exit path, publishing the advanced cursor in the same release store.
pub(crate) struct Consumer<'a> {
    queue: &'a GlobalQueue,
    cursor: *mut Task,
}

impl Consumer<'_> {
    pub(crate) fn pop(&mut self) -> Option<NonNull<Task>> {
        let stub = self.queue.stub_ptr();

        let mut cursor = self.cursor;
        if cursor == stub {
            let next = unsafe { (*cursor).next_atomic().load(Ordering::Acquire) };
            if next.is_null() {
                // Either drained or a producer is mid-publish; both read as
                // empty for this round.
                return None;
            }
            cursor = next;
            self.cursor = cursor;
        }

        let next = unsafe { (*cursor).next_atomic().load(Ordering::Acquire) };
        if !next.is_null() {
            self.cursor = next;
            return NonNull::new(cursor);
        }

        // `cursor` is the apparent last node. If a producer already swapped
        // `head` but has not linked yet, retry later.
        if self.queue.head.load(Ordering::Acquire) != cursor {
            return None;
        }

        // Re-anchor the stub behind the last node so the cursor never runs
        // off the list.
        self.queue
            .push(unsafe { Batch::from_task(NonNull::new_unchecked(stub)) });

        let next = unsafe { (*cursor).next_atomic().load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        self.cursor = next;
        NonNull::new(cursor)
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        // Publishes the new cursor and clears POLLING in one store.
        self.queue
            .tail
            .store(self.cursor as usize, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::NoopTask;

    #[test]
    fn starts_empty() {
        let queue = GlobalQueue::new();
        assert!(queue.is_empty());
        let mut consumer = queue.try_consume().unwrap();
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn push_pop_preserves_producer_order() {
        let queue = GlobalQueue::new();
        let tasks: Vec<NoopTask> = (0..16).map(|_| NoopTask::new()).collect();

        let mut batch = Batch::new();
        for t in &tasks {
            unsafe { batch.push_back(t.as_task()) };
        }
        queue.push(batch);
        assert!(!queue.is_empty());

        let mut consumer = queue.try_consume().unwrap();
        for t in &tasks {
            assert_eq!(consumer.pop(), Some(t.as_task()));
        }
        assert_eq!(consumer.pop(), None);
        drop(consumer);

        assert!(queue.is_empty());
    }

    #[test]
    fn consumer_lock_is_exclusive_until_dropped() {
        let queue = GlobalQueue::new();
        let consumer = queue.try_consume().unwrap();
        assert!(queue.try_consume().is_none());
        drop(consumer);
        assert!(queue.try_consume().is_some());
    }

    #[test]
    fn drain_and_refill_across_stub_reanchor() {
        let queue = GlobalQueue::new();

        for round in 0..3 {
            let tasks: Vec<NoopTask> = (0..4).map(|_| NoopTask::new()).collect();
            let mut batch = Batch::new();
            for t in &tasks {
                unsafe { batch.push_back(t.as_task()) };
            }
            queue.push(batch);

            let mut consumer = queue.try_consume().unwrap();
            for t in &tasks {
                assert_eq!(consumer.pop(), Some(t.as_task()), "round {round}");
            }
            assert_eq!(consumer.pop(), None);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn interleaved_push_pop() {
        let queue = GlobalQueue::new();
        let a = NoopTask::new();
        let b = NoopTask::new();

        queue.push(unsafe { Batch::from_task(a.as_task()) });
        {
            let mut consumer = queue.try_consume().unwrap();
            assert_eq!(consumer.pop(), Some(a.as_task()));
        }
        queue.push(unsafe { Batch::from_task(b.as_task()) });
        {
            let mut consumer = queue.try_consume().unwrap();
            assert_eq!(consumer.pop(), Some(b.as_task()));
            assert_eq!(consumer.pop(), None);
        }
        assert!(queue.is_empty());
    }
}
