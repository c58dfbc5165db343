//! Purpose: Futures, locks, and process executors shared by the `tandem` CLI and tests.
//! Exports: `api` (stable surface), plus the `core`, `future`, `sync`, `task`,
//! `worker_pool`, and `pinned` modules behind it.
//! Role: Library backing the binary; every process-backed piece assumes a Unix host.
//! Invariants: Task failures travel through futures; usage mistakes come back as `Error`.
//! Invariants: Only the spin lock token and process-future pipes cross process boundaries.
pub mod api;
pub mod core;
pub mod future;
pub mod pinned;
pub mod sync;
pub mod task;
pub mod worker_pool;
