use crate::task::waker::AtomicWaker;
use crate::task::Task;
use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// A do-nothing task with a stable address, for exercising batches and
/// queues directly.
#[derive(Debug)]
pub(crate) struct NoopTask {
    task: Box<Task>,
}

fn noop_run(_: NonNull<Task>) {}

impl NoopTask {
    pub(crate) fn new() -> Self {
        Self {
            task: Box::new(Task::new(noop_run)),
        }
    }

    pub(crate) fn as_task(&self) -> NonNull<Task> {
        NonNull::from(self.task.as_ref())
    }
}

/// One-shot cross-task notification: `wait()` suspends until `notify()`.
/// Never notifying is how tests provoke the deadlock detector.
#[derive(Debug, Default)]
pub(crate) struct NotifyCell {
    notified: AtomicBool,
    waker: AtomicWaker,
}

impl NotifyCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// May be called at most once.
    pub(crate) fn notify(&self) {
        self.notified.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub(crate) fn wait(self: &Arc<Self>) -> WaitFuture {
        WaitFuture {
            cell: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub(crate) struct WaitFuture {
    cell: Arc<NotifyCell>,
}

impl Future for WaitFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.cell.notified.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        if self.cell.waker.update(Some(cx.waker())) {
            Poll::Pending
        } else {
            // The notify fired between the check and the registration.
            Poll::Ready(())
        }
    }
}
