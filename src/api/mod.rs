//! Purpose: Define the stable public Rust API boundary for tandem.
//! Exports: Futures, synchronization primitives, executors, and the error model.
//! Role: Public, additive-only surface; callers should not need `core` paths.
//! Invariants: Internal plumbing (pipes, shared regions, callback lists) stays unexported.
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::ident::{OsThreadId, OwnerId, ProcessId};
pub use crate::core::outcome::{Callback, Outcome, TaskError, TaskErrorKind};
pub use crate::core::process::{
    ChildProcess, PANIC_EXIT_CODE, SpawnOptions, allowed_cores, cpu_count, set_affinity, spawn,
};
pub use crate::future::LocalFuture;
pub use crate::future::process::{ProcessConsumer, ProcessProducer, channel as process_channel};
pub use crate::future::thread::{Consumer, Producer, pair as thread_pair};
pub use crate::pinned::{CoreAllocator, PinnedTask};
pub use crate::sync::{
    ReadGuard, ReaderWriterLock, Semaphore, SemaphorePermit, SpinGuard, SpinLock, WriteGuard,
};
pub use crate::task::{Backing, TaskHandle};
pub use crate::worker_pool::{PoolOptions, PoolState, WorkerPool};
