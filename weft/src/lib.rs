//! An M:N task scheduler: a bounded pool of worker threads multiplexing
//! lightweight, externally-owned continuations through a three-level
//! run-queue hierarchy (per-worker ring, shared injector, idle-worker
//! stack), with randomized work stealing and cooperative hand-off.

#[doc(inline)]
pub use weft_macros::main;

#[doc(inline)]
pub use weft_macros::test;

pub mod runtime;
pub use runtime::{spawn, yield_now, Builder, RunError, Runtime};

pub mod task;
pub use task::{Batch, JoinHandle, Task};

mod context;

mod park;

mod pool;

mod queue;

mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
