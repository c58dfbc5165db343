// Synchronization primitives: cross-process spin lock, fair rwlock, counting semaphore.
pub mod rwlock;
pub mod semaphore;
pub mod spin;

pub use rwlock::{ReadGuard, ReaderWriterLock, WriteGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use spin::{SpinGuard, SpinLock};
