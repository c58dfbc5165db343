//! Purpose: Cross-thread future split into a producer handle and consumer handles.
//! Exports: `pair`, `Producer`, `Consumer`.
//! Role: Result channel of thread-backed tasks; outcome lives in shared memory.
//! Invariants: The producer is bound to exactly one thread; resolving from any other
//! thread fails with `WrongContext`, as does waiting from the producer thread.
//! Invariants: Consumers never gain producer operations; that split is in the types.
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
use crate::core::outcome::{Outcome, TaskError};
use crate::future::{Cell, not_ready, value_of};

struct Shared<T> {
    cell: Cell<T>,
    producer: OnceLock<ThreadId>,
}

pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Creates a future whose producer is the calling thread.
pub fn pair<T>() -> (Producer<T>, Consumer<T>) {
    let (producer, consumer) = unbound_pair();
    producer.bind_current();
    (producer, consumer)
}

/// Producer binds to whichever thread first calls `bind_current` or resolves.
pub(crate) fn unbound_pair<T>() -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared {
        cell: Cell::new(),
        producer: OnceLock::new(),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

impl<T> Producer<T> {
    pub(crate) fn bind_current(&self) {
        let _ = self.shared.producer.set(thread::current().id());
    }

    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.check_context()?;
        self.shared.cell.fulfill(Outcome::Value(value))
    }

    pub fn throw(&self, err: TaskError) -> Result<(), Error> {
        self.check_context()?;
        self.shared.cell.fulfill(Outcome::Error(err))
    }

    pub(crate) fn fulfill(&self, outcome: Outcome<T>) -> Result<(), Error> {
        self.check_context()?;
        self.shared.cell.fulfill(outcome)
    }

    pub fn is_fulfilled(&self) -> bool {
        self.shared.cell.outcome().is_some()
    }

    fn check_context(&self) -> Result<(), Error> {
        let current = thread::current().id();
        let bound = *self.shared.producer.get_or_init(|| current);
        if bound != current {
            return Err(Error::new(ErrorKind::WrongContext).with_message("cannot send reply as consumer"));
        }
        Ok(())
    }
}

impl<T> Consumer<T> {
    pub fn then<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.shared.cell.then(Box::new(callback))
    }

    pub fn is_fulfilled(&self) -> bool {
        self.shared.cell.outcome().is_some()
    }

    pub fn has_erred(&self) -> Option<bool> {
        self.shared.cell.outcome().map(|outcome| outcome.is_err())
    }

    fn check_context(&self) -> Result<(), Error> {
        if self.shared.producer.get() == Some(&thread::current().id()) {
            return Err(Error::new(ErrorKind::WrongContext).with_message("cannot poll reply as producer"));
        }
        Ok(())
    }
}

impl<T: Clone> Consumer<T> {
    pub fn response(&self) -> Result<T, Error> {
        value_of(&self.response_outcome()?)
    }

    pub fn response_outcome(&self) -> Result<Outcome<T>, Error> {
        self.check_context()?;
        self.shared
            .cell
            .outcome()
            .map(|outcome| (*outcome).clone())
            .ok_or_else(not_ready)
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, Error> {
        value_of(&self.wait_outcome(timeout)?)
    }

    pub fn wait_outcome(&self, timeout: Option<Duration>) -> Result<Outcome<T>, Error> {
        self.check_context()?;
        Ok((*self.shared.cell.wait(timeout)?).clone())
    }
}
