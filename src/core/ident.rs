//! Purpose: Name execution contexts (process + OS thread) for ownership checks.
//! Exports: `ProcessId`, `OsThreadId`, `OwnerId`.
//! Role: Shared by futures (producer/consumer checks) and the cross-process spin lock.
//! Invariants: `OwnerId` equality is a typed pair comparison; the one-word
//! encoding used in shared memory stays private to this crate.
//! Invariants: The encoded form of a live owner is never zero.
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub fn current() -> Self {
        ProcessId(std::process::id())
    }
}

/// Kernel-level thread id, unique across the system while the thread lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OsThreadId(pub u32);

impl OsThreadId {
    pub fn current() -> Self {
        OsThreadId(current_os_tid())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OwnerId {
    pub process: ProcessId,
    pub thread: OsThreadId,
}

impl OwnerId {
    pub fn current() -> Self {
        Self {
            process: ProcessId::current(),
            thread: OsThreadId::current(),
        }
    }

    pub(crate) fn encode(self) -> u64 {
        (u64::from(self.process.0) << 32) | u64::from(self.thread.0)
    }

    pub(crate) fn decode(word: u64) -> Option<Self> {
        if word == 0 {
            return None;
        }
        Some(Self {
            process: ProcessId((word >> 32) as u32),
            thread: OsThreadId(word as u32),
        })
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process.0, self.thread.0)
    }
}

#[cfg(target_os = "linux")]
fn current_os_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
fn current_os_tid() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static TID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|tid| *tid)
}
