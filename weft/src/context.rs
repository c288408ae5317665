//! Thread-local handle to the worker currently running on this OS thread.
//!
//! Worker-side scheduling APIs (`Batch::schedule`, task wakes, spawning)
//! resolve their pool and worker through here instead of threading them
//! through every call site.

use crate::pool::worker::Worker;
use crate::pool::Pool;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

struct WorkerContext {
    pool: Arc<Pool>,
    worker: NonNull<Worker>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Install `worker` as this thread's context for the lifetime of the
/// returned guard; the previous context (if any) is restored on drop.
pub(crate) fn enter(pool: Arc<Pool>, worker: &Worker) -> ContextGuard {
    let prev = CONTEXT.with(|ctx| {
        ctx.borrow_mut().replace(WorkerContext {
            pool,
            worker: NonNull::from(worker),
        })
    });
    ContextGuard { prev }
}

pub(crate) struct ContextGuard {
    prev: Option<WorkerContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = self.prev.take();
        });
    }
}

/// Run `f` with the current worker, or `None` when the calling thread is not
/// a pool worker.
pub(crate) fn with_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Arc<Pool>, &Worker) -> R,
{
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let ctx = ctx.as_ref()?;
        // Safety: the worker is owned by the pool kept alive by `ctx.pool`,
        // and the guard uninstalls the context before the run loop returns.
        Some(f(&ctx.pool, unsafe { ctx.worker.as_ref() }))
    })
}

/// Like [`with_worker`], but calling from a non-worker thread is a contract
/// violation.
#[track_caller]
pub(crate) fn expect_worker<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Pool>, &Worker) -> R,
{
    with_worker(f).expect("called from outside the thread pool")
}
