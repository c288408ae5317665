use crate::queue::global::Consumer;
use crate::task::{Batch, Task};
use std::hint;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Number of tasks a worker can hold locally before spilling to the global
/// queue. Power of two so wrapping cursors index the buffer cheaply.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;

/// Per-worker bounded run queue: a ring buffer indexed by wrapping `u32`
/// cursors. The owning worker is the only writer of `tail` (and of the
/// buffer cells it claims); any sibling may CAS `head` forward to steal.
///
/// Invariant: `tail - head (mod 2^32)` never exceeds the capacity.
#[derive(Debug)]
pub(crate) struct LocalQueue {
    head: AtomicU32,
    tail: AtomicU32,
    buffer: [AtomicPtr<Task>; LOCAL_QUEUE_CAPACITY],
}

impl Default for LocalQueue {
    fn default() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicPtr<Task> = AtomicPtr::new(ptr::null_mut());
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            buffer: [EMPTY; LOCAL_QUEUE_CAPACITY],
        }
    }
}

impl LocalQueue {
    fn write(&self, index: u32, task: NonNull<Task>) {
        self.buffer[index as usize % LOCAL_QUEUE_CAPACITY].store(task.as_ptr(), Ordering::Relaxed);
    }

    fn read(&self, index: u32) -> NonNull<Task> {
        let task = self.buffer[index as usize % LOCAL_QUEUE_CAPACITY].load(Ordering::Relaxed);
        NonNull::new(task).expect("invalid task read from local run queue")
    }

    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner-only: append a batch, spilling to the caller when the ring is
    /// full. Free capacity is filled first (the tail store publishes each
    /// chunk); once full, half of the buffer is claimed back with a CAS on
    /// our own `head` and returned, together with the unplaced remainder,
    /// for the global queue. The claimed half was written by this worker, so
    /// handing it off publishes nothing new to stealers.
    pub(crate) fn push_batch(&self, mut batch: Batch) -> Option<Batch> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            if batch.is_empty() {
                return None;
            }

            let head = self.head.load(Ordering::Relaxed);
            let size = tail.wrapping_sub(head);
            assert!(
                size as usize <= LOCAL_QUEUE_CAPACITY,
                "local run queue size exceeds capacity"
            );

            let free = LOCAL_QUEUE_CAPACITY - size as usize;
            if free > 0 {
                for _ in 0..free {
                    let Some(task) = batch.pop_front() else { break };
                    self.write(tail, task);
                    tail = tail.wrapping_add(1);
                }
                self.tail.store(tail, Ordering::Release);
                continue;
            }

            // Ring is full: migrate half of it, plus whatever is left of the
            // batch, to the caller. Stealers race on `head`, so a lost CAS
            // just means capacity opened up.
            let migrate = (LOCAL_QUEUE_CAPACITY / 2) as u32;
            if self
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(migrate),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }

            let mut overflow = Batch::new();
            for offset in 0..migrate {
                unsafe { overflow.push_back(self.read(head.wrapping_add(offset))) };
            }
            overflow.push_back_batch(batch);
            return Some(overflow);
        }
    }

    /// Owner-only pop from the front. Uses a CAS (not a plain store) on
    /// `head` because stealers race on it.
    pub(crate) fn pop(&self) -> Option<NonNull<Task>> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            match self.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(self.read(head)),
                Err(observed) => head = observed,
            }
        }
    }

    /// Steal roughly half of `self` into `dst`, the thief's own (empty)
    /// ring. The first stolen task is returned directly; the rest are
    /// published with a single release store of `dst.tail`.
    ///
    /// Buffer cells are copied with relaxed loads before the validating CAS
    /// on `head`: a lost race discards the copies, and a won race proves the
    /// owner never rewrote the `[head, tail)` range we read.
    pub(crate) fn steal_into(&self, dst: &LocalQueue) -> Option<NonNull<Task>> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);

            let size = tail.wrapping_sub(head);
            if size == 0 {
                return None;
            }
            if size as usize > LOCAL_QUEUE_CAPACITY {
                // The owner republished `tail` between our two loads.
                hint::spin_loop();
                continue;
            }

            let take = size - size / 2;
            let first = self.read(head);

            let dst_tail = dst.tail.load(Ordering::Relaxed);
            debug_assert_eq!(
                dst_tail,
                dst.head.load(Ordering::Relaxed),
                "stealing into a non-empty local run queue"
            );
            for offset in 1..take {
                let task = self.read(head.wrapping_add(offset));
                dst.write(dst_tail.wrapping_add(offset - 1), task);
            }

            if self
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(take),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                hint::spin_loop();
                continue;
            }

            if take > 1 {
                dst.tail
                    .store(dst_tail.wrapping_add(take - 1), Ordering::Release);
            }
            return Some(first);
        }
    }

    /// Owner-only: top the ring up from the global queue after a successful
    /// global pop.
    ///
    /// The tail store and the head reload are both SeqCst: with anything
    /// weaker the head reload may be hoisted above the tail publication,
    /// overestimating free capacity while stealers are mid-claim.
    pub(crate) fn refill(&self, consumer: &mut Consumer<'_>) {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::SeqCst);
            let size = tail.wrapping_sub(head);
            debug_assert!(size as usize <= LOCAL_QUEUE_CAPACITY);

            let free = LOCAL_QUEUE_CAPACITY - size as usize;
            if free == 0 {
                return;
            }

            let mut copied = 0;
            while copied < free {
                let Some(task) = consumer.pop() else { break };
                self.write(tail, task);
                tail = tail.wrapping_add(1);
                copied += 1;
            }
            if copied == 0 {
                return;
            }
            self.tail.store(tail, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::GlobalQueue;
    use crate::test_utils::NoopTask;

    fn batch_of(tasks: &[NoopTask]) -> Batch {
        let mut batch = Batch::new();
        for t in tasks {
            unsafe { batch.push_back(t.as_task()) };
        }
        batch
    }

    #[test]
    fn push_then_pop_is_fifo() {
        let queue = LocalQueue::default();
        let tasks: Vec<NoopTask> = (0..10).map(|_| NoopTask::new()).collect();

        assert!(queue.push_batch(batch_of(&tasks)).is_none());
        assert_eq!(queue.len(), tasks.len());

        for t in &tasks {
            assert_eq!(queue.pop(), Some(t.as_task()));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn fills_to_capacity_without_overflow() {
        let queue = LocalQueue::default();
        let tasks: Vec<NoopTask> = (0..LOCAL_QUEUE_CAPACITY).map(|_| NoopTask::new()).collect();

        assert!(queue.push_batch(batch_of(&tasks)).is_none());
        assert_eq!(queue.len(), LOCAL_QUEUE_CAPACITY);
    }

    #[test]
    fn burst_beyond_capacity_overflows_half_plus_remainder() {
        let queue = LocalQueue::default();
        let tasks: Vec<NoopTask> = (0..LOCAL_QUEUE_CAPACITY + 1).map(|_| NoopTask::new()).collect();

        let overflow = queue.push_batch(batch_of(&tasks)).expect("burst must overflow");

        // Half the ring plus the one task that never fit.
        assert_eq!(overflow.len(), LOCAL_QUEUE_CAPACITY / 2 + 1);
        assert_eq!(queue.len(), LOCAL_QUEUE_CAPACITY / 2);

        // The ring keeps the newest half; the overflow batch starts with the
        // oldest tasks in their original order.
        let mut overflow = overflow;
        for t in tasks.iter().take(LOCAL_QUEUE_CAPACITY / 2) {
            assert_eq!(overflow.pop_front(), Some(t.as_task()));
        }
        assert_eq!(overflow.pop_front(), Some(tasks[LOCAL_QUEUE_CAPACITY].as_task()));
        assert!(overflow.is_empty());
    }

    #[test]
    fn steal_takes_half_and_returns_first() {
        let victim = LocalQueue::default();
        let thief = LocalQueue::default();
        let tasks: Vec<NoopTask> = (0..8).map(|_| NoopTask::new()).collect();
        assert!(victim.push_batch(batch_of(&tasks)).is_none());

        let stolen = victim.steal_into(&thief).expect("victim had tasks");

        assert_eq!(stolen, tasks[0].as_task());
        assert_eq!(thief.len(), 3);
        assert_eq!(victim.len(), 4);

        for t in tasks.iter().skip(1).take(3) {
            assert_eq!(thief.pop(), Some(t.as_task()));
        }
        for t in tasks.iter().skip(4) {
            assert_eq!(victim.pop(), Some(t.as_task()));
        }
    }

    #[test]
    fn steal_single_task_publishes_nothing() {
        let victim = LocalQueue::default();
        let thief = LocalQueue::default();
        let t = NoopTask::new();
        assert!(victim.push_batch(unsafe { Batch::from_task(t.as_task()) }).is_none());

        assert_eq!(victim.steal_into(&thief), Some(t.as_task()));
        assert!(victim.is_empty());
        assert!(thief.is_empty());
    }

    #[test]
    fn steal_from_empty_returns_none() {
        let victim = LocalQueue::default();
        let thief = LocalQueue::default();
        assert_eq!(victim.steal_into(&thief), None);
    }

    #[test]
    fn refill_tops_up_from_global() {
        let global = GlobalQueue::new();
        let local = LocalQueue::default();
        let tasks: Vec<NoopTask> = (0..32).map(|_| NoopTask::new()).collect();
        global.push(batch_of(&tasks));

        let mut consumer = global.try_consume().unwrap();
        let first = consumer.pop().unwrap();
        assert_eq!(first, tasks[0].as_task());
        local.refill(&mut consumer);
        drop(consumer);

        assert!(global.is_empty());
        assert_eq!(local.len(), tasks.len() - 1);
        for t in tasks.iter().skip(1) {
            assert_eq!(local.pop(), Some(t.as_task()));
        }
    }
}
