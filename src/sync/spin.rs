//! Purpose: Re-entrant spin lock whose owner token lives in shared memory.
//! Exports: `SpinLock`, `SpinGuard`.
//! Role: Mutual exclusion across threads and processes (forked children or any
//! process opening the same named region).
//! Invariants: The shared token is non-zero iff some thread holds the lock.
//! Invariants: The re-entrancy depth is per handle and only touched by the owner.
//! Invariants: Re-entry must go through the handle that took the lock; a second handle on
//! the same region held by the same thread gets `Usage`.
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::ident::OwnerId;
use crate::core::shm::SharedRegion;

const OWNER_WORD: usize = 0;
const SPINS_PER_YIELD: u32 = 64;

pub struct SpinLock {
    region: SharedRegion,
    depth: AtomicU32,
}

impl SpinLock {
    /// Lock shared with this process's threads and with children forked afterwards.
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            region: SharedRegion::anonymous()?,
            depth: AtomicU32::new(0),
        })
    }

    /// Lock shared with every process that opens `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self {
            region: SharedRegion::open_or_create(path)?,
            depth: AtomicU32::new(0),
        })
    }

    fn token(&self) -> &AtomicU64 {
        self.region.word(OWNER_WORD)
    }

    pub fn owner(&self) -> Option<OwnerId> {
        OwnerId::decode(self.token().load(Ordering::Acquire))
    }

    pub fn is_acquired(&self) -> bool {
        self.owner() == Some(OwnerId::current())
    }

    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let me = OwnerId::current();
        let word = me.encode();
        let start = Instant::now();
        let mut spins = 0u32;
        loop {
            match self
                .token()
                .compare_exchange(0, word, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.depth.store(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(current) if current == word => {
                    if self.depth.load(Ordering::Relaxed) == 0 {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message("spin lock is held by this thread through another handle"));
                    }
                    self.depth.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(_) => {}
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    let mut err = Error::new(ErrorKind::TimedOut).with_message("spin lock not acquired");
                    if let Some(owner) = self.owner() {
                        err = err.with_pid(owner.process.0 as i32);
                    }
                    return Err(err);
                }
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_PER_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    pub fn release(&self) -> Result<(), Error> {
        let me = OwnerId::current().encode();
        if self.token().load(Ordering::Acquire) != me || self.depth.load(Ordering::Relaxed) == 0 {
            return Err(Error::new(ErrorKind::NotAcquired).with_message("lock not acquired"));
        }
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.token().store(0, Ordering::Release);
        }
        Ok(())
    }

    pub fn lock(&self, timeout: Option<Duration>) -> Result<SpinGuard<'_>, Error> {
        self.acquire(timeout)?;
        Ok(SpinGuard { lock: self })
    }
}

impl Drop for SpinLock {
    fn drop(&mut self) {
        if self.depth.load(Ordering::Relaxed) > 0 && self.is_acquired() {
            tracing::warn!("spin lock dropped while held; releasing");
            self.depth.store(0, Ordering::Relaxed);
            self.token().store(0, Ordering::Release);
        }
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            tracing::error!(error = %err, "spin guard release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use crate::core::error::ErrorKind;
    use crate::core::ident::OwnerId;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_for_the_owner() {
        let lock = SpinLock::new().expect("lock");
        lock.acquire(None).expect("first");
        lock.acquire(Some(Duration::ZERO)).expect("reentrant");
        assert_eq!(lock.owner(), Some(OwnerId::current()));

        lock.release().expect("inner release");
        assert!(lock.is_acquired());
        lock.release().expect("outer release");
        assert_eq!(lock.owner(), None);

        let err = lock.release().expect_err("extra release");
        assert_eq!(err.kind(), ErrorKind::NotAcquired);
    }

    #[test]
    fn other_threads_block_until_release() {
        let lock = Arc::new(SpinLock::new().expect("lock"));
        let guard = lock.lock(None).expect("lock");

        let contender = lock.clone();
        let err = std::thread::spawn(move || {
            contender
                .acquire(Some(Duration::from_millis(20)))
                .expect_err("held elsewhere")
                .kind()
        })
        .join()
        .expect("join");
        assert_eq!(err, ErrorKind::TimedOut);

        let contender = lock.clone();
        let err = std::thread::spawn(move || contender.release().expect_err("not owner").kind())
            .join()
            .expect("join");
        assert_eq!(err, ErrorKind::NotAcquired);

        drop(guard);
        let contender = lock.clone();
        std::thread::spawn(move || {
            contender.acquire(Some(Duration::from_secs(1))).expect("free now");
            contender.release().expect("release");
        })
        .join()
        .expect("join");
    }

    #[test]
    fn named_locks_share_one_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spin.lock");
        let first = SpinLock::open(&path).expect("first");
        let second = SpinLock::open(&path).expect("second");
        first.acquire(None).expect("acquire");
        assert_eq!(second.owner(), Some(OwnerId::current()));
        first.release().expect("release");
        assert_eq!(second.owner(), None);
    }

    #[test]
    fn second_handle_cannot_reenter_or_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spin.lock");
        let held = SpinLock::open(&path).expect("held");
        let other = SpinLock::open(&path).expect("other");
        held.acquire(None).expect("acquire");

        let err = other.acquire(Some(Duration::ZERO)).expect_err("other handle");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(other.release().expect_err("other release").kind(), ErrorKind::NotAcquired);
        assert_eq!(held.owner(), Some(OwnerId::current()));

        held.release().expect("release");
        assert_eq!(held.owner(), None);
    }

    #[test]
    fn dropping_an_idle_handle_keeps_the_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("spin.lock");
        let held = SpinLock::open(&path).expect("held");
        held.acquire(None).expect("acquire");
        {
            let _idle = SpinLock::open(&path).expect("idle");
        }
        assert_eq!(held.owner(), Some(OwnerId::current()));
        held.release().expect("release");
        assert_eq!(held.owner(), None);
    }
}
