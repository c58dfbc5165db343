//! Purpose: Producer/consumer futures for same-thread, cross-thread, and cross-process tasks.
//! Exports: `LocalFuture`, `thread::{Producer, Consumer, pair}`, `process::{ProcessProducer, ProcessConsumer, channel}`.
//! Role: Result channel returned by every task launch.
//! Invariants: Pending -> Fulfilled happens exactly once; a second resolve/throw fails
//! with `AlreadyFulfilled` and leaves the stored outcome untouched.
//! Invariants: Polling before fulfillment fails with `NotReady`; only `wait` blocks.
pub mod local;
pub mod process;
pub mod thread;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::outcome::{Callback, Callbacks, Outcome};

pub use local::LocalFuture;

struct Slot<T> {
    outcome: Option<Arc<Outcome<T>>>,
    callbacks: Callbacks<T>,
}

/// In-memory state shared by local and thread futures.
pub(crate) struct Cell<T> {
    slot: Mutex<Slot<T>>,
    fulfilled: Condvar,
}

impl<T> Cell<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                outcome: None,
                callbacks: Callbacks::new(),
            }),
            fulfilled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn fulfill(&self, outcome: Outcome<T>) -> Result<(), Error> {
        let (outcome, callbacks) = {
            let mut slot = self.lock();
            if slot.outcome.is_some() {
                return Err(Error::new(ErrorKind::AlreadyFulfilled).with_message("response already sent"));
            }
            let outcome = Arc::new(outcome);
            slot.outcome = Some(outcome.clone());
            (outcome, slot.callbacks.take())
        };
        self.fulfilled.notify_all();
        callbacks.fire(&outcome);
        Ok(())
    }

    pub(crate) fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        self.lock().outcome.clone()
    }

    pub(crate) fn then(&self, callback: Callback<T>) -> Result<(), Error> {
        let mut slot = self.lock();
        if slot.outcome.is_some() {
            return Err(Error::new(ErrorKind::AlreadyHandled).with_message("response already handled"));
        }
        slot.callbacks.push(callback);
        Ok(())
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Arc<Outcome<T>>, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return Ok(outcome.clone());
            }
            slot = match deadline {
                None => self
                    .fulfilled
                    .wait(slot)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(timed_out());
                    }
                    self.fulfilled
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

pub(crate) fn timed_out() -> Error {
    Error::new(ErrorKind::TimedOut).with_message("no response within timeout")
}

pub(crate) fn not_ready() -> Error {
    Error::new(ErrorKind::NotReady).with_message("no response received")
}

/// Clones the value out of a shared outcome, surfacing task errors as `ErrorKind::Task`.
pub(crate) fn value_of<T: Clone>(outcome: &Outcome<T>) -> Result<T, Error> {
    outcome.clone().into_result()
}
