use crate::pool::{Pool, ResumeOpts};
use crate::task::future::{self, JoinHandle};
use crate::task::Batch;
use crate::{context, task};
use anyhow::Result;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

#[cfg(test)]
mod tests;

/// Error surface of [`Runtime::block_on`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// Every worker parked with the entry future still pending: nothing can
    /// ever wake it, so the pool shut itself down.
    #[error("entry future deadlocked: all workers parked with it still pending")]
    Deadlocked,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn name(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    let counter = Arc::new(AtomicUsize::new(0));
    ThreadNameFn(Arc::new(move || {
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        format!("weft-worker-{}", prev)
    }))
}

/// Resolved configuration a pool is built from.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

/// Configures a [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core, and is silently capped at the CPU
    /// count and the slot index space.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    /// Sets the number of worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `val` is 0.
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of threads spawned by the runtime's pool.
    ///
    /// The default names are "weft-worker-{N}".
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function generating the names of threads spawned by the
    /// runtime's pool.
    pub fn thread_name_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured [`Runtime`].
    pub fn try_build(&self) -> Result<Runtime> {
        let cpus = thread::available_parallelism()?.get();
        let worker_threads = self
            .worker_threads
            .unwrap_or(cpus)
            .min(cpus)
            .min(crate::pool::slot::MAX_SLOTS)
            .max(1);

        Ok(Runtime {
            cfg: PoolConfig {
                worker_threads,
                thread_name: self.thread_name.clone(),
                thread_stack_size: self.thread_stack_size,
            },
        })
    }
}

/// A handle to runtime configuration. Each [`Runtime::block_on`] call builds
/// a fresh pool, drives the future on it with the calling thread acting as
/// the first worker, and tears the pool down before returning.
#[derive(Debug)]
pub struct Runtime {
    cfg: PoolConfig,
}

impl Runtime {
    pub(crate) fn worker_threads(&self) -> usize {
        self.cfg.worker_threads
    }

    /// Run `future` to completion on a fresh pool and return its output.
    ///
    /// The calling thread becomes the pool's first worker, so the future's
    /// children run on up to `worker_threads` OS threads including this one.
    /// Returns [`RunError::Deadlocked`] when the future suspends in a way
    /// nothing can ever wake; any tasks still suspended at that point are
    /// leaked, since their wakers may be held by arbitrary clones.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, RunError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pool = Pool::new(self.cfg.clone());

        // Completion of the entry future, not an idle pool, is the normal
        // shutdown trigger; the wrapper fires it after the output exists.
        let entry = async move {
            let output = future.await;
            context::expect_worker(|pool, _| pool.shutdown());
            output
        };
        let (mut handle, entry_task) = future::allocate_entry(&pool, entry);

        // The caller is not a worker yet, so the entry goes through the
        // global queue; the resume below turns this thread into worker 0.
        pool.run_queue.push(unsafe { Batch::from_task(entry_task) });
        pool.resume_thread(ResumeOpts {
            was_waking: false,
            no_spawn: true,
        });

        // Our run loop has exited; collect the rest of the pool.
        pool.join_workers();

        match poll_join_handle(&mut handle) {
            Poll::Ready(output) => Ok(output),
            Poll::Pending => Err(RunError::Deadlocked),
        }
    }
}

/// One waker-less poll of the entry handle, after the pool has already
/// quiesced: pending here is final.
fn poll_join_handle<T>(handle: &mut JoinHandle<T>) -> Poll<T> {
    let mut cx = Context::from_waker(Waker::noop());
    Pin::new(handle).poll(&mut cx)
}

pub use task::future::{spawn, yield_now, YieldNow};
